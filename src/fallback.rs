//! Offline stand-in for the upstream model.
//!
//! Used when no API key is configured, and optionally when the upstream is
//! unreachable. Replies are canned and keyword driven; streaming splits the
//! reply into groups of one to three words with a small delay between them.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::Result;
use crate::relay::{ChatRelay, EventStream};
use crate::types::{ChatReply, ChatTurnRequest, DownstreamEvent};

const DEMO_NOTE: &str = "\n\nℹ️ Это демо-режим. Для подключения к реальному GigaChat API укажите ваш API ключ в файле .env";

const GREETING: &str = "Привет! Я виртуальный помощник. Рад вас видеть! Чем могу помочь?";
const STATUS: &[&str] = &[
    "У меня всё отлично! Готов помочь вам с любыми вопросами.",
    "Всё прекрасно! А у вас как дела?",
    "Работаю в штатном режиме. Чем могу быть полезен?",
];
const WEATHER: &str = "К сожалению, в демо-режиме я не могу предоставить актуальные данные о погоде. Но могу порекомендовать посмотреть специализированные сервисы!";
const HELP: &str = "Я могу ответить на ваши вопросы в демо-режиме. Попробуйте спросить о чём-нибудь! Для полной функциональности потребуется API ключ GigaChat.";
const FAREWELL: &str = "До свидания! Было приятно пообщаться. Возвращайтесь снова!";
const QUESTION: &[&str] = &[
    "Интересный вопрос! В реальном режиме я мог бы дать более развернутый ответ.",
    "Хороший вопрос. К сожалению, в демо-режиме мои возможности ограничены.",
    "Сложный вопрос! Для точного ответа мне потребуется доступ к реальной модели GigaChat.",
    "Отличный вопрос! Рекомендую задать его при подключенном API для получения точного ответа.",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Topic {
    Greeting,
    Status,
    Weather,
    Time,
    Help,
    Farewell,
    Question,
    Other,
}

fn classify(message: &str) -> Topic {
    let lower = message.to_lowercase();
    let has_any = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));
    let has_word = |word: &str| {
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| token == word)
    };

    if has_any(&["привет", "здравствуй", "hello"]) || has_word("hi") {
        Topic::Greeting
    } else if has_any(&["как дела", "как ты", "how are you"]) {
        Topic::Status
    } else if has_any(&["погода", "weather"]) {
        Topic::Weather
    } else if has_any(&["время", "который час"]) || has_word("time") {
        Topic::Time
    } else if has_any(&["помощь", "help", "команды"]) {
        Topic::Help
    } else if has_any(&["пока", "прощай", "goodbye"]) || has_word("bye") {
        Topic::Farewell
    } else if message.contains('?') {
        Topic::Question
    } else {
        Topic::Other
    }
}

fn pick<'a>(options: &[&'a str]) -> &'a str {
    options.choose(&mut rand::thread_rng()).copied().unwrap_or_default()
}

fn server_time() -> String {
    let format = time::macros::format_description!("[hour]:[minute]:[second]");
    time::OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_else(|_| "--:--:--".to_string())
}

fn reply_for(message: &str) -> String {
    match classify(message) {
        Topic::Greeting => GREETING.to_string(),
        Topic::Status => pick(STATUS).to_string(),
        Topic::Weather => WEATHER.to_string(),
        Topic::Time => format!(
            "Сейчас {} (UTC). Но помните, это время на сервере, а не ваше локальное время!",
            server_time()
        ),
        Topic::Help => HELP.to_string(),
        Topic::Farewell => FAREWELL.to_string(),
        Topic::Question => pick(QUESTION).to_string(),
        Topic::Other => {
            let options = [
                format!("Вы сказали: '{message}'. Интересно! В реальном режиме я мог бы обсудить это подробнее."),
                format!("Я понял ваше сообщение: '{message}'. Это демо-версия чата. Для полной функциональности нужен API ключ GigaChat."),
                format!("Спасибо за сообщение! Вы написали: '{message}'. В реальном режиме я бы дал более содержательный ответ."),
                "Интересное сообщение! К сожалению, в демо-режиме мои ответы ограничены. Для полной версии укажите API ключ в файле .env".to_string(),
            ];
            options
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or_default()
        }
    }
}

/// Splits `text` into words that keep their trailing whitespace, so the
/// pieces concatenate back to `text` exactly.
fn word_segments(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    let mut seen_word = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_space = true;
            continue;
        }
        if in_space && seen_word {
            out.push(&text[start..idx]);
            start = idx;
        }
        in_space = false;
        seen_word = true;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn random_delay(range: &Range<Duration>) -> Duration {
    if range.start >= range.end {
        return range.start;
    }
    rand::thread_rng().gen_range(range.clone())
}

#[derive(Clone, Debug)]
pub struct FallbackResponder {
    reply_delay: Range<Duration>,
    chunk_delay: Range<Duration>,
    note_probability: f64,
}

impl Default for FallbackResponder {
    fn default() -> Self {
        Self {
            reply_delay: Duration::from_millis(500)..Duration::from_millis(2000),
            chunk_delay: Duration::from_millis(50)..Duration::from_millis(200),
            note_probability: 0.3,
        }
    }
}

impl FallbackResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delays(mut self, reply: Range<Duration>, chunk: Range<Duration>) -> Self {
        self.reply_delay = reply;
        self.chunk_delay = chunk;
        self
    }

    pub fn without_delays(self) -> Self {
        self.with_delays(Duration::ZERO..Duration::ZERO, Duration::ZERO..Duration::ZERO)
    }

    /// Chance of appending the demo-mode note to a reply, clamped to `0.0..=1.0`.
    pub fn with_note_probability(mut self, probability: f64) -> Self {
        self.note_probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self
    }

    /// Builds the full reply text for `message`.
    pub fn reply(&self, message: &str) -> String {
        let mut text = reply_for(message);
        if rand::thread_rng().gen_bool(self.note_probability) {
            text.push_str(DEMO_NOTE);
        }
        text
    }

    /// Groups of one to three words, each paired with the delay that precedes it.
    fn plan_chunks(&self, text: &str) -> Vec<(Duration, String)> {
        let segments = word_segments(text);
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < segments.len() {
            let take = rng.gen_range(1..=3).min(segments.len() - idx);
            let chunk = segments[idx..idx + take].concat();
            out.push((random_delay(&self.chunk_delay), chunk));
            idx += take;
        }
        out
    }
}

#[async_trait]
impl ChatRelay for FallbackResponder {
    async fn complete(&self, request: &ChatTurnRequest) -> Result<ChatReply> {
        request.validate()?;
        let delay = random_delay(&self.reply_delay);
        let response = self.reply(&request.message);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        tracing::info!(dialog_id = %request.dialog_id, "fallback reply sent");
        Ok(ChatReply { response })
    }

    fn stream(&self, request: ChatTurnRequest) -> EventStream {
        if let Err(err) = request.validate() {
            return stream::iter([DownstreamEvent::failed(err.to_string())]).boxed();
        }

        let chunks = self.plan_chunks(&self.reply(&request.message));
        let mut accumulated = String::new();
        let mut events = Vec::with_capacity(chunks.len() + 1);
        for (delay, chunk) in chunks {
            accumulated.push_str(&chunk);
            events.push((delay, DownstreamEvent::delta(chunk, accumulated.clone())));
        }
        events.push((Duration::ZERO, DownstreamEvent::completed(accumulated)));

        stream::iter(events)
            .then(|(delay, event)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                event
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> FallbackResponder {
        FallbackResponder::new()
            .without_delays()
            .with_note_probability(0.0)
    }

    #[test]
    fn keywords_pick_topics() {
        assert_eq!(classify("Привет, бот"), Topic::Greeting);
        assert_eq!(classify("Hi!"), Topic::Greeting);
        assert_eq!(classify("this is fine"), Topic::Other);
        assert_eq!(classify("Как дела?"), Topic::Status);
        assert_eq!(classify("какая погода"), Topic::Weather);
        assert_eq!(classify("what time is it"), Topic::Time);
        assert_eq!(classify("нужна помощь"), Topic::Help);
        assert_eq!(classify("ну пока"), Topic::Farewell);
        assert_eq!(classify("зачем?"), Topic::Question);
        assert_eq!(classify("просто текст"), Topic::Other);
    }

    #[test]
    fn other_replies_may_echo_the_message() {
        for _ in 0..20 {
            let reply = reply_for("просто текст");
            assert!(reply.contains("'просто текст'") || reply.contains("демо-режиме"));
        }
    }

    #[test]
    fn note_is_appended_when_certain() {
        let responder = quiet().with_note_probability(1.0);
        assert!(responder.reply("hello").ends_with(DEMO_NOTE));
        assert!(!quiet().reply("hello").contains("ℹ️"));
    }

    #[test]
    fn word_segments_round_trip() {
        let text = "  Привет!  Как\n\nдела? ";
        let segments = word_segments(text);
        assert_eq!(segments.concat(), text);
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn chunks_hold_one_to_three_words() {
        let text = "one two three four five six seven eight nine ten";
        let chunks = quiet().plan_chunks(text);
        let joined: String = chunks.iter().map(|(_, chunk)| chunk.as_str()).collect();
        assert_eq!(joined, text);
        for (_, chunk) in &chunks {
            let words = chunk.split_whitespace().count();
            assert!((1..=3).contains(&words), "{chunk:?}");
        }
    }

    #[tokio::test]
    async fn stream_follows_downstream_contract() {
        let events: Vec<_> = quiet()
            .stream(ChatTurnRequest::new("hello").streaming())
            .collect()
            .await;

        let last = events.last().cloned().unwrap_or_default();
        assert_eq!(last, DownstreamEvent::completed(GREETING));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let mut previous = String::new();
        for event in &events[..events.len() - 1] {
            let accumulated = event.accumulated.clone().unwrap_or_default();
            let chunk = event.chunk.clone().unwrap_or_default();
            assert_eq!(accumulated, format!("{previous}{chunk}"));
            previous = accumulated;
        }
    }

    #[tokio::test]
    async fn complete_returns_reply_and_rejects_blank() -> Result<()> {
        let reply = quiet().complete(&ChatTurnRequest::new("bye")).await?;
        assert_eq!(reply.response, FAREWELL);
        assert!(quiet().complete(&ChatTurnRequest::new(" ")).await.is_err());
        Ok(())
    }
}
