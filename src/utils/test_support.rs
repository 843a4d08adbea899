//! Helpers shared by unit and integration tests.

/// `true` when the sandbox refuses loopback binds, so httpmock tests bail out early.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping httpmock test: loopback bind denied");
            true
        }
        Err(err) => panic!("failed to probe localhost for httpmock tests: {err}"),
    }
}

/// Renders upstream-style SSE: one `data:` frame per payload plus the `[DONE]` sentinel.
pub fn upstream_sse(payloads: &[serde_json::Value]) -> String {
    let mut out = String::new();
    for payload in payloads {
        out.push_str("data: ");
        out.push_str(&payload.to_string());
        out.push_str("\n\n");
    }
    out.push_str("data: [DONE]\n\n");
    out
}

/// Upstream streaming payload carrying a single content delta.
pub fn delta_payload(text: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{ "delta": { "content": text }, "index": 0 }]
    })
}
