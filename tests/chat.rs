//! Chat agent scenarios: permission filtering, mode-specific tool sets,
//! and transcript handling, all against in-process fakes.

mod common;

use std::sync::Arc;

use knowledge_agent::models::{ChatContext, ChatMessage, ChatRole, SearchMode};

use common::*;

fn question(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: ChatRole::User,
        content: text.to_string(),
    }]
}

fn rag_context() -> ChatContext {
    ChatContext {
        site_url: SITE_URL.to_string(),
        search_mode: Some(SearchMode::Rag),
    }
}

#[tokio::test]
async fn knowledge_search_returns_only_accessible_documents() {
    let doc1 = pdf_document("doc-1", "alpha.pdf");
    let doc2 = pdf_document("doc-2", "beta.pdf");
    let doc3 = pdf_document("doc-3", "gamma.pdf");

    let provider = Arc::new(
        FakeProvider::new(vec![])
            .with_probe("doc-1", ProbeBehavior::Forbidden)
            .with_probe("doc-2", ProbeBehavior::Allow)
            .with_probe("doc-3", ProbeBehavior::Forbidden),
    );
    let index = Arc::new(FakeIndex::new());
    seed_chunk(&index, &doc1, 0, "vacation policy draft").await;
    seed_chunk(&index, &doc2, 0, "vacation policy final").await;
    seed_chunk(&index, &doc3, 0, "vacation policy appendix").await;

    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedModel::calls(vec![(
            "call_1",
            "knowledge_search",
            r#"{"query":"what is the vacation policy?"}"#,
        )]),
        ScriptedModel::answer("It appears that the final policy applies."),
    ]));

    let core = chat_core(
        model.clone(),
        provider,
        Arc::new(FakeEmbedder::new()),
        index,
        Arc::new(FakeExtractor::new()),
        SearchMode::Kql,
    );
    let outcome = core
        .handle(test_user(), question("what is the vacation policy?"), rag_context())
        .await
        .unwrap();

    assert_eq!(outcome.search_mode, SearchMode::Rag);
    assert_eq!(outcome.response, "It appears that the final policy applies.");

    // The tool output the model saw lists exactly one source: document 2.
    let results = model.tool_results_before_call(1);
    assert_eq!(results.len(), 1);
    let block = &results[0];
    assert_eq!(block.matches("Source ").count(), 1);
    assert!(block.contains("ItemId: doc-2"));
    assert!(!block.contains("doc-1"));
    assert!(!block.contains("doc-3"));
}

#[tokio::test]
async fn every_ambiguous_probe_outcome_fails_closed() {
    for behavior in [
        ProbeBehavior::Forbidden,
        ProbeBehavior::NotFound,
        ProbeBehavior::ServerError,
        ProbeBehavior::Timeout,
        ProbeBehavior::Malformed,
    ] {
        let doc = pdf_document("doc-x", "restricted.pdf");
        let provider = Arc::new(FakeProvider::new(vec![]).with_default_probe(behavior));
        let index = Arc::new(FakeIndex::new());
        seed_chunk(&index, &doc, 0, "restricted content").await;

        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::calls(vec![(
                "call_1",
                "knowledge_search",
                r#"{"query":"restricted content"}"#,
            )]),
            ScriptedModel::answer("done"),
        ]));
        let core = chat_core(
            model.clone(),
            provider,
            Arc::new(FakeEmbedder::new()),
            index,
            Arc::new(FakeExtractor::new()),
            SearchMode::Rag,
        );
        core.handle(test_user(), question("restricted content"), rag_context())
            .await
            .unwrap();

        let results = model.tool_results_before_call(1);
        assert!(
            results[0].contains("No accessible documents"),
            "probe outcome {:?} must filter the chunk out",
            behavior
        );
    }
}

#[tokio::test]
async fn access_decisions_are_memoized_per_request() {
    let doc = pdf_document("doc-1", "handbook.pdf");
    let provider = Arc::new(FakeProvider::new(vec![]));
    let index = Arc::new(FakeIndex::new());
    seed_chunk(&index, &doc, 0, "first chunk of the handbook").await;
    seed_chunk(&index, &doc, 1, "second chunk of the handbook").await;

    // Two knowledge_search rounds in one request.
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedModel::calls(vec![("call_1", "knowledge_search", r#"{"query":"handbook"}"#)]),
        ScriptedModel::calls(vec![("call_2", "knowledge_search", r#"{"query":"handbook"}"#)]),
        ScriptedModel::answer("done"),
    ]));
    let core = chat_core(
        model,
        provider.clone(),
        Arc::new(FakeEmbedder::new()),
        index,
        Arc::new(FakeExtractor::new()),
        SearchMode::Rag,
    );
    core.handle(test_user(), question("handbook"), rag_context())
        .await
        .unwrap();

    // One decision per document id, regardless of chunks or rounds.
    assert_eq!(provider.probe_count("doc-1"), 1);
}

#[tokio::test]
async fn rag_dedupes_to_the_best_chunk_per_document() {
    let doc1 = pdf_document("doc-1", "alpha.pdf");
    let doc2 = pdf_document("doc-2", "beta.pdf");
    let provider = Arc::new(FakeProvider::new(vec![]));
    let index = Arc::new(FakeIndex::new().with_score("doc-1", 0.95).with_score("doc-2", 0.8));
    seed_chunk(&index, &doc1, 0, "intro").await;
    seed_chunk(&index, &doc1, 1, "details").await;
    seed_chunk(&index, &doc2, 0, "other doc").await;

    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedModel::calls(vec![("call_1", "knowledge_search", r#"{"query":"details"}"#)]),
        ScriptedModel::answer("done"),
    ]));
    let core = chat_core(
        model.clone(),
        provider,
        Arc::new(FakeEmbedder::new()),
        index,
        Arc::new(FakeExtractor::new()),
        SearchMode::Rag,
    );
    core.handle(test_user(), question("details"), rag_context())
        .await
        .unwrap();

    let block = &model.tool_results_before_call(1)[0];
    // One source per document, highest-scoring document first.
    assert_eq!(block.matches("ItemId: doc-1").count(), 1);
    assert_eq!(block.matches("ItemId: doc-2").count(), 1);
    let first = block.find("ItemId: doc-1").unwrap();
    let second = block.find("ItemId: doc-2").unwrap();
    assert!(first < second);
}

#[tokio::test]
async fn kql_mode_selects_the_keyword_tool_set() {
    let doc = pdf_document("doc-7", "onboarding.pdf");
    let provider = Arc::new(FakeProvider::new(vec![doc]));
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedModel::calls(vec![(
            "call_1",
            "sharepoint_search",
            r#"{"query":"onboarding"}"#,
        )]),
        ScriptedModel::answer("It appears that onboarding.pdf covers this."),
    ]));

    let core = chat_core(
        model.clone(),
        provider,
        Arc::new(FakeEmbedder::new()),
        Arc::new(FakeIndex::new()),
        Arc::new(FakeExtractor::new()),
        SearchMode::Kql,
    );
    // No mode in the context: the configured default (kql) applies.
    let context = ChatContext {
        site_url: SITE_URL.to_string(),
        search_mode: None,
    };
    let outcome = core
        .handle(test_user(), question("how does onboarding work?"), context)
        .await
        .unwrap();

    assert_eq!(outcome.search_mode, SearchMode::Kql);

    let offered = &model.tools_seen.lock().unwrap()[0];
    assert!(offered.contains(&"sharepoint_search".to_string()));
    assert!(!offered.contains(&"knowledge_search".to_string()));
    assert!(offered.contains(&"get_current_site".to_string()));
    assert!(offered.contains(&"get_current_user".to_string()));
    assert!(offered.contains(&"read_file_content".to_string()));

    let listing = &model.tool_results_before_call(1)[0];
    assert!(listing.contains("onboarding.pdf"));
    assert!(listing.contains("\"itemId\": \"doc-7\""));
    assert!(listing.contains("\"driveId\": \"drive-1\""));
    assert!(listing.contains("lastModified"));
}

#[tokio::test]
async fn multiple_tool_calls_in_one_turn_interleave_correctly() {
    let provider = Arc::new(FakeProvider::new(vec![]));
    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedModel::calls(vec![
            ("call_site", "get_current_site", "{}"),
            ("call_user", "get_current_user", "{}"),
        ]),
        ScriptedModel::answer("done"),
    ]));

    let core = chat_core(
        model.clone(),
        provider,
        Arc::new(FakeEmbedder::new()),
        Arc::new(FakeIndex::new()),
        Arc::new(FakeExtractor::new()),
        SearchMode::Kql,
    );
    core.handle(test_user(), question("who am I and where am I?"), ChatContext {
        site_url: SITE_URL.to_string(),
        search_mode: None,
    })
    .await
    .unwrap();

    // Results appear after the assistant turn, in call order.
    let transcript = &model.received.lock().unwrap()[1];
    let tool_messages: Vec<_> = transcript.iter().filter(|m| m.role == "tool").collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_site"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_user"));
    assert!(tool_messages[1]
        .content
        .as_deref()
        .unwrap()
        .contains("Dana Reyes"));
}

#[tokio::test]
async fn read_file_content_truncates_large_documents() {
    let provider = Arc::new(FakeProvider::new(vec![]));
    let long_text = "knowledge ".repeat(1000);
    let extractor = Arc::new(FakeExtractor::new().with_text("file-9", &long_text));

    let model = Arc::new(ScriptedModel::new(vec![
        ScriptedModel::calls(vec![(
            "call_1",
            "read_file_content",
            r#"{"driveId":"drive-1","itemId":"file-9","name":"big.pdf"}"#,
        )]),
        ScriptedModel::answer("done"),
    ]));
    let core = chat_core(
        model.clone(),
        provider,
        Arc::new(FakeEmbedder::new()),
        Arc::new(FakeIndex::new()),
        extractor,
        SearchMode::Kql,
    );
    core.handle(test_user(), question("read the big file"), ChatContext {
        site_url: SITE_URL.to_string(),
        search_mode: None,
    })
    .await
    .unwrap();

    let content = &model.tool_results_before_call(1)[0];
    assert!(content.ends_with("[Content truncated]"));
    assert!(content.chars().count() < long_text.chars().count());
}

#[tokio::test]
async fn tool_failures_become_error_strings_not_request_failures() {
    let provider = Arc::new(FakeProvider::new(vec![]));
    let model = Arc::new(ScriptedModel::new(vec![
        // Unknown tool name and bad arguments in one turn.
        ScriptedModel::calls(vec![
            ("call_1", "no_such_tool", "{}"),
            ("call_2", "read_file_content", "{not valid json"),
        ]),
        ScriptedModel::answer("recovered"),
    ]));

    let core = chat_core(
        model.clone(),
        provider,
        Arc::new(FakeEmbedder::new()),
        Arc::new(FakeIndex::new()),
        Arc::new(FakeExtractor::new()),
        SearchMode::Kql,
    );
    let outcome = core
        .handle(test_user(), question("anything"), ChatContext {
            site_url: SITE_URL.to_string(),
            search_mode: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.response, "recovered");
    let results = model.tool_results_before_call(1);
    assert!(results[0].starts_with("Error: unknown tool"));
    assert!(results[1].starts_with("Error: invalid tool arguments"));
}

#[tokio::test]
async fn transcript_grows_by_exactly_one_assistant_message() {
    let provider = Arc::new(FakeProvider::new(vec![]));
    let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::answer(
        "It appears that nothing was asked.",
    )]));
    let core = chat_core(
        model,
        provider,
        Arc::new(FakeEmbedder::new()),
        Arc::new(FakeIndex::new()),
        Arc::new(FakeExtractor::new()),
        SearchMode::Kql,
    );

    let history = vec![
        ChatMessage {
            role: ChatRole::User,
            content: "hello".to_string(),
        },
        ChatMessage {
            role: ChatRole::Assistant,
            content: "hi".to_string(),
        },
        ChatMessage {
            role: ChatRole::User,
            content: "anything new?".to_string(),
        },
    ];
    let outcome = core
        .handle(test_user(), history.clone(), ChatContext {
            site_url: SITE_URL.to_string(),
            search_mode: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.messages.len(), history.len() + 1);
    let last = outcome.messages.last().unwrap();
    assert_eq!(last.role, ChatRole::Assistant);
    assert_eq!(last.content, outcome.response);
}
