use common::ApiStyle;
use curator::llm::remote::RemoteLlmProvider;
use curator::llm::{LlmProvider, LlmRequest, ProviderError};
use mockito::Matcher;

fn request(prompt: &str) -> LlmRequest {
    LlmRequest {
        system: Some("Select headlines".to_string()),
        prompt: prompt.to_string(),
        max_tokens: Some(100),
        temperature: Some(0.3),
        timeout_seconds: Some(10),
    }
}

#[tokio::test]
async fn test_openai_style_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer fake-api-key")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "model": "qwen/qwen3-32b",
            "messages": [
                {"role": "system", "content": "Select headlines"},
                {"role": "user", "content": "0: Budget passed"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model": "qwen/qwen3-32b",
                "choices": [{
                    "message": {"role": "assistant", "content": "  [0]  "},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }"#,
        )
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "qwen/qwen3-32b");
    let response = provider.generate(&request("0: Budget passed")).await.unwrap();

    assert_eq!(response.content, "[0]");
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.completion_tokens, 5);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model, "qwen/qwen3-32b");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_gemini_style_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/gemini-2.5-flash-lite:generateContent")
        .match_query(Matcher::UrlEncoded("key".into(), "gemini-key".into()))
        .match_body(Matcher::PartialJson(serde_json::json!({
            "contents": [{"parts": [{"text": "Select headlines"}, {"text": "3: Floods"}]}],
            "generationConfig": {"maxOutputTokens": 100}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "candidates": [{"content": {"parts": [{"text": "[{\"id\": 3, \"category\": \"Disaster\"}]"}]}}],
                "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 4, "totalTokenCount": 11}
            }"#,
        )
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "gemini-key", "gemini-2.5-flash-lite")
        .with_style(ApiStyle::Gemini);
    let response = provider.generate(&request("3: Floods")).await.unwrap();

    assert_eq!(response.content, r#"[{"id": 3, "category": "Disaster"}]"#);
    assert_eq!(response.usage.total_tokens, 11);
    assert_eq!(response.model, "gemini-2.5-flash-lite");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_status_classification() {
    let cases = [
        (429, "slow down"),
        (503, "overloaded"),
        (400, "bad request"),
    ];
    for (status, body) in cases {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(status)
            .with_body(body)
            .create_async()
            .await;

        let provider = RemoteLlmProvider::new(server.url(), "k", "m");
        let err = provider.generate(&request("0: x")).await.unwrap_err();
        match status {
            429 => assert!(matches!(err, ProviderError::RateLimited(_))),
            503 => assert!(matches!(err, ProviderError::Server { status: 503, .. })),
            _ => assert!(matches!(err, ProviderError::Api { status: 400, .. })),
        }

        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_in_band_error_with_200() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "model not found", "code": 404}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "k", "kimi-k2-instruct-0905");
    let err = provider.generate(&request("0: x")).await.unwrap_err();
    match err {
        ProviderError::Reported(message) => assert_eq!(message, "model not found"),
        other => panic!("unexpected error: {:?}", other),
    }

    mock.assert_async().await;
}

#[tokio::test]
async fn test_plain_text_body_is_passed_through() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_body("Sure! Here you go: [1, 2]")
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "k", "m");
    let response = provider.generate(&request("0: x")).await.unwrap();
    assert_eq!(response.content, "Sure! Here you go: [1, 2]");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_timeout() {
    let mut server = mockito::Server::new_async().await;

    // Slow response: the body callback blocks past the request timeout
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"[1]")
        })
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "k", "m");
    let mut req = request("0: x");
    req.timeout_seconds = Some(1);

    let err = provider.generate(&req).await.unwrap_err();
    assert!(matches!(err, ProviderError::Network(ref m) if m.contains("timed out")));
}

#[tokio::test]
async fn test_list_models_from_chat_endpoint() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("GET", "/v1/models")
        .match_header("authorization", "Bearer k")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": [{"id": "kimi-k2-instruct-0905"}, {"id": "llama-3.3-70b"}]}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(format!("{}/v1/chat/completions", server.url()), "k", "m");
    let ids = provider.list_models().await.unwrap();
    assert_eq!(ids, vec!["kimi-k2-instruct-0905", "llama-3.3-70b"]);

    mock.assert_async().await;
}
