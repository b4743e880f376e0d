//! Sandbox for lifecycle scripts (`onLoad`, `beforeSave`, `afterSave`).
//!
//! Scripts are JavaScript run on an embedded QuickJS engine that can only reach the record,
//! the context constants, `console` and three host functions. Each run happens on a blocking
//! thread with its own heap limit and deadline; whatever the script does, the caller gets a
//! [`ScriptOutcome`] back.

mod engine;

use crate::email::EmailSender;
use crate::settings::Settings;
use crate::store::Row;
use engine::{Limits, Run};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    NewRecord,
    EditRecord,
    ViewRecord,
}

impl UserAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UserAction::NewRecord => "new_record",
            UserAction::EditRecord => "edit_record",
            UserAction::ViewRecord => "view_record",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMoment {
    BeforeSave,
    AfterSave,
    FormLoad,
}

impl ExecutionMoment {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMoment::BeforeSave => "before_save",
            ExecutionMoment::AfterSave => "after_save",
            ExecutionMoment::FormLoad => "form_load",
        }
    }
}

/// Read-only constants visible to a script run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptContext {
    pub user_action: UserAction,
    pub execution_moment: ExecutionMoment,
    pub user_id: Option<String>,
    pub table_id: String,
}

/// Result of one script run. Failures are values, never errors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ScriptOutcome {
    pub fn ok() -> Self {
        ScriptOutcome {
            success: true,
            error: None,
            stack: None,
        }
    }

    pub fn failed(error: impl Into<String>, stack: Option<String>) -> Self {
        ScriptOutcome {
            success: false,
            error: Some(error.into()),
            stack,
        }
    }
}

/// Error reported by [`ScriptSandbox::check_syntax`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptError {
    pub name: String,
    pub message: String,
    pub line: Option<usize>,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}: {} (line {})", self.name, self.message, line),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

pub struct ScriptSandbox {
    email: Arc<dyn EmailSender>,
    email_from: String,
    limits: Limits,
}

impl ScriptSandbox {
    pub fn new(email: Arc<dyn EmailSender>, settings: &Settings) -> Self {
        ScriptSandbox {
            email,
            email_from: settings.email_from.clone(),
            limits: Limits {
                timeout: settings.script_timeout,
                memory: settings.script_memory_limit,
            },
        }
    }

    /// Compile without running. Blank code is valid.
    pub fn check_syntax(code: &str) -> Result<(), ScriptError> {
        if code.trim().is_empty() {
            return Ok(());
        }
        engine::check_syntax(code)
    }

    /// Run `code` against `doc`.
    ///
    /// Each slug in `fields` is bound to the global `<table>_<field>` (hyphens become
    /// underscores, `$` prefix optional); variables the script changed are written back when
    /// it completes. `setFieldValue` writes land in `doc` immediately and survive a later
    /// failure.
    pub async fn handle(
        &self,
        code: &str,
        doc: &mut Row,
        slug: &str,
        fields: &[String],
        ctx: &ScriptContext,
    ) -> ScriptOutcome {
        if code.trim().is_empty() {
            return ScriptOutcome::ok();
        }

        let shared = Arc::new(Mutex::new(std::mem::take(doc)));
        let run = Run {
            code: code.to_string(),
            table_slug: slug.to_string(),
            fields: fields.to_vec(),
            context: ctx.clone(),
            row: shared.clone(),
            email: self.email.clone(),
            email_from: self.email_from.clone(),
            limits: self.limits,
            tokio: tokio::runtime::Handle::current(),
        };
        let outcome = match tokio::task::spawn_blocking(move || run.execute()).await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                tracing::error!(table = %slug, error = %join_error, "script task failed");
                ScriptOutcome::failed("script execution aborted", None)
            }
        };
        *doc = std::mem::take(&mut *shared.lock().unwrap_or_else(|e| e.into_inner()));
        tracing::debug!(
            table = %slug,
            moment = ctx.execution_moment.as_str(),
            success = outcome.success,
            "script finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{EmailMessage, EmailReceipt};
    use crate::error::AppError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<EmailMessage>>);

    #[async_trait]
    impl EmailSender for Outbox {
        async fn send(&self, message: EmailMessage) -> Result<EmailReceipt, AppError> {
            let accepted = message.to.clone();
            self.0.lock().unwrap().push(message);
            Ok(EmailReceipt {
                accepted,
                ..Default::default()
            })
        }
    }

    fn sandbox() -> (ScriptSandbox, Arc<Outbox>) {
        let outbox = Arc::new(Outbox::default());
        let settings = Settings {
            script_timeout: Duration::from_millis(2_000),
            script_memory_limit: 16 * 1024 * 1024,
            ..Settings::default()
        };
        (ScriptSandbox::new(outbox.clone(), &settings), outbox)
    }

    fn ctx() -> ScriptContext {
        ScriptContext {
            user_action: UserAction::EditRecord,
            execution_moment: ExecutionMoment::BeforeSave,
            user_id: Some("u1".into()),
            table_id: "t1".into(),
        }
    }

    fn doc(v: Value) -> Row {
        match v {
            Value::Object(m) => m,
            _ => Row::new(),
        }
    }

    async fn run(code: &str, row: Value, fields: &[&str]) -> (ScriptOutcome, Row) {
        let (sandbox, _) = sandbox();
        let mut row = doc(row);
        let fields: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
        let outcome = sandbox.handle(code, &mut row, "posts", &fields, &ctx()).await;
        (outcome, row)
    }

    #[tokio::test]
    async fn field_variables_round_trip() {
        let (outcome, row) = run("posts_title = \"new\";", json!({"title": "old"}), &["title"]).await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(row["title"], json!("new"));
    }

    #[tokio::test]
    async fn edits_through_aliases_reach_the_record() {
        let (outcome, row) = run("const t = posts_tags\nt.push('b')", json!({"tags": ["a"]}), &["tags"]).await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(row["tags"], json!(["a", "b"]));

        let code = "const m = { n: { ok: false } }\nconst n = m.n\nn.ok = true\nsetFieldValue('r', m.n.ok)";
        let (outcome, row) = run(code, json!({}), &[]).await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(row["r"], json!(true));
    }

    #[tokio::test]
    async fn arbitrary_input_never_escapes() {
        let inputs = [
            "",
            "   ",
            "{",
            "if (x { }",
            "throw new Error('boom')",
            "undefinedThing.call()",
            "while (true) {}",
            "function f() { return f() } f()",
            "let s = `unterminated",
            "))))",
            "null.x",
        ];
        for code in inputs {
            let (outcome, _) = run(code, json!({"title": "a"}), &["title"]).await;
            if code.trim().is_empty() {
                assert!(outcome.success);
            } else {
                assert!(!outcome.success, "expected failure for {:?}", code);
                assert!(outcome.error.is_some());
            }
        }
    }

    #[tokio::test]
    async fn runaway_allocation_is_a_failed_run() {
        let code = "let a = []\nwhile (true) { a.push(new Array(100000).fill(0)) }";
        let (outcome, row) = run(code, json!({"title": "kept"}), &["title"]).await;
        assert!(!outcome.success);
        assert!(!outcome.error.unwrap_or_default().is_empty());
        assert_eq!(row["title"], json!("kept"));

        let (outcome, _) = run("let s = 'x'\nwhile (true) { s = s + s }", json!({}), &[]).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn runtime_errors_carry_message_and_stack() {
        let (outcome, _) = run("let a = 1\nthrow new Error('boom')", json!({}), &[]).await;
        assert_eq!(outcome.error.as_deref(), Some("boom"));
        let stack = outcome.stack.unwrap_or_default();
        assert!(stack.contains(":2"), "{}", stack);

        let (outcome, _) = run("let a = 1;\nif (a { }", json!({}), &[]).await;
        let error = outcome.error.unwrap_or_default();
        assert!(error.starts_with("SyntaxError"), "{}", error);
        assert!(error.ends_with("(line 2)"), "{}", error);
    }

    #[tokio::test]
    async fn set_field_value_survives_a_later_throw() {
        let code = "setFieldValue('status', 'done')\nposts_title = 'ignored'\nthrow 'stop'";
        let (outcome, row) = run(code, json!({"title": "t", "status": "open"}), &["title", "status"]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("stop"));
        assert_eq!(row["status"], json!("done"));
        assert_eq!(row["title"], json!("t"));
    }

    #[tokio::test]
    async fn get_field_value_coerces_text() {
        let code = r#"
            const qty = getFieldValue('qty')
            const due = getFieldValue('due')
            if (typeof qty !== 'number') throw new Error('qty')
            if (!(due instanceof Date)) throw new Error('due')
            setFieldValue('total', qty * 2)
            setFieldValue('year', due.getUTCFullYear())
            setFieldValue('flag', getFieldValue('flag') === true)
            setFieldValue('missing', getFieldValue('nope') === undefined)
        "#;
        let (outcome, row) = run(code, json!({"qty": "21", "due": "2024-03-05", "flag": "true"}), &[]).await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(row["total"], json!(42));
        assert_eq!(row["year"], json!(2024));
        assert_eq!(row["flag"], json!(true));
        assert_eq!(row["missing"], json!(true));
    }

    #[tokio::test]
    async fn set_field_value_is_not_overwritten_by_stale_variable() {
        let (outcome, row) = run("setFieldValue('title', 'via api')", json!({"title": "old"}), &["title"]).await;
        assert!(outcome.success);
        assert_eq!(row["title"], json!("via api"));

        let (_, row) = run("setFieldValue('title', 'x'); posts_title += '!'", json!({"title": "old"}), &["title"]).await;
        assert_eq!(row["title"], json!("x!"));
    }

    #[tokio::test]
    async fn language_features() {
        let code = r#"
            const tags = posts_tags || []
            tags.push('new')
            let total = 0
            for (const n of [1, 2, 3]) total += n
            for (let i = 0; i < 10; i++) { if (i % 2) continue; if (i > 6) break; total += 100 }
            const doubled = tags.map((t, i) => `${i}:${t.toUpperCase()}`).join('|')
            const meta = { count: tags.length, nested: { ok: true } }
            meta.nested.ok = false
            let caught = ''
            try { null.x } catch (e) { caught = e.name } finally { total += 1 }
            setFieldValue('summary', doubled)
            setFieldValue('total', total)
            setFieldValue('meta', meta)
            setFieldValue('caught', caught)
            setFieldValue('who', `${userAction}/${executionMoment}/${userId}/${tableId}`)
        "#;
        let (outcome, row) = run(code, json!({"tags": ["a"]}), &["tags"]).await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(row["tags"], json!(["a", "new"]));
        assert_eq!(row["summary"], json!("0:A|1:NEW"));
        assert_eq!(row["total"], json!(407));
        assert_eq!(row["meta"], json!({"count": 2, "nested": {"ok": false}}));
        assert_eq!(row["caught"], json!("TypeError"));
        assert_eq!(row["who"], json!("edit_record/before_save/u1/t1"));
    }

    #[tokio::test]
    async fn context_constants_are_read_only() {
        let (outcome, row) = run("userId = 'x'\nsetFieldValue('reached', true)", json!({}), &[]).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert!(row.get("reached").is_none());
    }

    #[tokio::test]
    async fn hyphenated_slugs_and_placeholders() {
        let mut row = doc(json!({"due-date": "2024-01-01"}));
        let (sandbox, _) = sandbox();
        let outcome = sandbox
            .handle(
                "$my_table_due_date = '2025-01-01'",
                &mut row,
                "my-table",
                &["due-date".to_string()],
                &ctx(),
            )
            .await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(row["due-date"], json!("2025-01-01"));
    }

    #[tokio::test]
    async fn send_email_reports_without_throwing() {
        let (sandbox, outbox) = sandbox();
        let mut row = doc(json!({}));
        let code = "const r = await sendEmail('a@x.com, b@x.com', 'Hi', 'Body')\nsetFieldValue('sent', r.success)";
        let outcome = sandbox.handle(code, &mut row, "posts", &[], &ctx()).await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(row["sent"], json!(true));
        let sent = outbox.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["a@x.com".to_string(), "b@x.com".to_string()]);
        assert_eq!(sent[0].from, "no-reply@localhost");
    }

    #[tokio::test]
    async fn deadline_is_not_catchable() {
        let (sandbox, _) = sandbox();
        let mut row = doc(json!({}));
        let outcome = sandbox
            .handle(
                "try { while (true) {} } catch (e) { }\nsetFieldValue('after', 1)",
                &mut row,
                "posts",
                &[],
                &ctx(),
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("script timed out after 2000 ms"));
        assert!(row.get("after").is_none());
    }

    #[test]
    fn check_syntax_reports_line() {
        assert!(ScriptSandbox::check_syntax("").is_ok());
        assert!(ScriptSandbox::check_syntax("let a = 1\nposts_title = a").is_ok());
        assert!(ScriptSandbox::check_syntax("const r = await sendEmail('a@x.com', 's', 'b')").is_ok());
        let err = ScriptSandbox::check_syntax("let a = 1\nlet b = ;").unwrap_err();
        assert_eq!(err.name, "SyntaxError");
        assert_eq!(err.line, Some(2));
    }
}
