mod common;

use common::{field, id_of, row, state, table};
use dyntable_sdk::config::MethodScript;
use dyntable_sdk::config::TableMethods;
use dyntable_sdk::{AppError, FieldType, Page, RequestContext, RowService, TableService};
use serde_json::json;
use std::collections::HashMap;

fn script(code: &str) -> Option<MethodScript> {
    Some(MethodScript { code: code.into() })
}

async fn list_all(state: &dyntable_sdk::AppState, slug: &str) -> Vec<dyntable_sdk::Row> {
    RowService::list(state, slug, &HashMap::new(), Page::default(), &RequestContext::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn failing_before_save_blocks_persistence() {
    let (state, _) = state();
    let posts = table(&state, "Posts").await;
    field(&state, &posts, "Title", FieldType::TextShort).await;
    let methods = TableMethods {
        before_save: script("if (posts_title.length < 3) {\n  throw new Error('title too short')\n}"),
        ..TableMethods::default()
    };
    TableService::update_methods(&state, &posts.id, methods).await.unwrap();

    let ctx = RequestContext::user("u1");
    let err = RowService::create(&state, "posts", row(json!({"title": "ab"})), &ctx)
        .await
        .unwrap_err();
    match &err {
        AppError::Script(message) => assert_eq!(message, "Erro no beforeSave: title too short"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(err.code(), "script_error");
    assert!(list_all(&state, "posts").await.is_empty());

    let stored = RowService::create(&state, "posts", row(json!({"title": "long enough"})), &ctx)
        .await
        .unwrap();
    assert_eq!(stored["title"], json!("long enough"));
    assert_eq!(list_all(&state, "posts").await.len(), 1);
}

#[tokio::test]
async fn failing_after_save_keeps_the_row() {
    let (state, _) = state();
    let posts = table(&state, "Posts").await;
    field(&state, &posts, "Title", FieldType::TextShort).await;
    let methods = TableMethods {
        after_save: script("throw new Error('notification service down')"),
        ..TableMethods::default()
    };
    TableService::update_methods(&state, &posts.id, methods).await.unwrap();

    let stored = RowService::create(&state, "posts", row(json!({"title": "hello"})), &RequestContext::default())
        .await
        .unwrap();
    assert_eq!(stored["title"], json!("hello"));
    let rows = list_all(&state, "posts").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(id_of(&rows[0]), id_of(&stored));
}

#[tokio::test]
async fn before_save_sees_action_and_edits_are_persisted() {
    let (state, _) = state();
    let posts = table(&state, "Posts").await;
    field(&state, &posts, "Title", FieldType::TextShort).await;
    field(&state, &posts, "Status", FieldType::TextShort).await;
    let methods = TableMethods {
        before_save: script(
            "posts_title = posts_title.trim()\n\
             setFieldValue('status', userAction + '/' + executionMoment)",
        ),
        ..TableMethods::default()
    };
    TableService::update_methods(&state, &posts.id, methods).await.unwrap();

    let ctx = RequestContext::default();
    let created = RowService::create(&state, "posts", row(json!({"title": "  padded  "})), &ctx)
        .await
        .unwrap();
    assert_eq!(created["title"], json!("padded"));
    assert_eq!(created["status"], json!("new_record/before_save"));

    let id = id_of(&created);
    let saved = RowService::save(&state, "posts", &id, row(json!({"title": " again "})), &ctx)
        .await
        .unwrap();
    assert_eq!(saved["title"], json!("again"));
    assert_eq!(saved["status"], json!("edit_record/before_save"));

    let loaded = RowService::get(&state, "posts", &id, &ctx).await.unwrap();
    assert_eq!(loaded["status"], json!("edit_record/before_save"));
}

#[tokio::test]
async fn after_save_can_send_email() {
    let (state, outbox) = state();
    let posts = table(&state, "Posts").await;
    field(&state, &posts, "Title", FieldType::TextShort).await;
    let methods = TableMethods {
        after_save: script(
            "if (userAction === 'new_record') {\n\
               const result = await sendEmail(['editor@example.com'], 'New post', `Title: ${posts_title}`)\n\
               if (!result.success) throw new Error('mail failed')\n\
             }",
        ),
        ..TableMethods::default()
    };
    TableService::update_methods(&state, &posts.id, methods).await.unwrap();

    let ctx = RequestContext::default();
    let created = RowService::create(&state, "posts", row(json!({"title": "Launch"})), &ctx)
        .await
        .unwrap();
    RowService::save(&state, "posts", &id_of(&created), row(json!({"title": "Launch v2"})), &ctx)
        .await
        .unwrap();

    let sent = outbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["editor@example.com".to_string()]);
    assert_eq!(sent[0].subject, "New post");
    assert_eq!(sent[0].body, "Title: Launch");
    assert_eq!(sent[0].from, state.settings.email_from);
}

#[tokio::test]
async fn on_load_runs_per_row_without_persisting() {
    let (state, _) = state();
    let posts = table(&state, "Posts").await;
    field(&state, &posts, "Title", FieldType::TextShort).await;
    let methods = TableMethods {
        on_load: script("posts_title = `[${posts_title}]`"),
        ..TableMethods::default()
    };
    TableService::update_methods(&state, &posts.id, methods).await.unwrap();

    let ctx = RequestContext::default();
    for title in ["a", "b"] {
        RowService::create(&state, "posts", row(json!({"title": title})), &ctx)
            .await
            .unwrap();
    }
    let first: Vec<_> = list_all(&state, "posts").await.into_iter().map(|r| r["title"].clone()).collect();
    assert_eq!(first, vec![json!("[a]"), json!("[b]")]);
    let second: Vec<_> = list_all(&state, "posts").await.into_iter().map(|r| r["title"].clone()).collect();
    assert_eq!(second, first);
}

#[tokio::test]
async fn failing_on_load_still_returns_rows() {
    let (state, _) = state();
    let posts = table(&state, "Posts").await;
    field(&state, &posts, "Title", FieldType::TextShort).await;
    let methods = TableMethods {
        on_load: script("missing.call()"),
        ..TableMethods::default()
    };
    TableService::update_methods(&state, &posts.id, methods).await.unwrap();
    RowService::create(&state, "posts", row(json!({"title": "x"})), &RequestContext::default())
        .await
        .unwrap();
    let rows = list_all(&state, "posts").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["title"], json!("x"));
}
