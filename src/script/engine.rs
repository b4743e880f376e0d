//! One script run on an embedded QuickJS runtime.
//!
//! Every run gets a fresh runtime with a heap limit, a native stack limit and an interrupt
//! handler that fires at the deadline. Record fields are plain global variables (with a
//! `$`-prefixed alias each); the context constants are global `const` declarations, so
//! assigning one throws.

use super::{ScriptContext, ScriptError, ScriptOutcome};
use crate::email::{EmailMessage, EmailReceipt, EmailSender};
use crate::query::parse_timestamp;
use crate::slug::field_variable;
use crate::store::Row;
use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest};
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Exception, Function, IntoJs, Object, Promise, Runtime, Value};
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Native stack available to script code.
const STACK_LIMIT: usize = 512 * 1024;

/// Heap for a syntax check, which only compiles.
const SYNTAX_CHECK_MEMORY: usize = 8 * 1024 * 1024;

const LOG_TARGET: &str = "dyntable_sdk::script";

#[derive(Clone, Copy, Debug)]
pub(crate) struct Limits {
    pub timeout: Duration,
    pub memory: usize,
}

/// A record field exposed as a global variable.
struct Binding {
    variable: String,
    slug: String,
    /// Value the host last put in the variable; `None` while undefined.
    written: Option<Json>,
}

/// State shared by the host functions of one run.
struct Host {
    row: Arc<Mutex<Row>>,
    bindings: Mutex<Vec<Binding>>,
    email: Arc<dyn EmailSender>,
    email_from: String,
    tokio: tokio::runtime::Handle,
    deadline: Instant,
}

impl Host {
    /// Deliver through the async sender from the blocking script thread. Never longer than
    /// the run has left.
    fn send(&self, message: EmailMessage) -> Result<EmailReceipt, String> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self
            .tokio
            .block_on(tokio::time::timeout(remaining, self.email.send(message)))
        {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("sendEmail timed out".into()),
        }
    }
}

pub(crate) struct Run {
    pub code: String,
    pub table_slug: String,
    pub fields: Vec<String>,
    pub context: ScriptContext,
    pub row: Arc<Mutex<Row>>,
    pub email: Arc<dyn EmailSender>,
    pub email_from: String,
    pub limits: Limits,
    pub tokio: tokio::runtime::Handle,
}

impl Run {
    /// Execute on the current (blocking) thread.
    pub fn execute(self) -> ScriptOutcome {
        let deadline = Instant::now() + self.limits.timeout;
        let expired = Arc::new(AtomicBool::new(false));
        let (_runtime, context) = match open(self.limits.memory, Some((deadline, expired.clone()))) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "script engine failed to start");
                return ScriptOutcome::failed(format!("script engine unavailable: {}", e), None);
            }
        };

        let bindings = {
            let doc = lock(&self.row);
            self.fields
                .iter()
                .map(|slug| Binding {
                    variable: field_variable(&self.table_slug, slug),
                    slug: slug.clone(),
                    written: doc.get(slug).cloned(),
                })
                .collect()
        };
        let host = Arc::new(Host {
            row: self.row.clone(),
            bindings: Mutex::new(bindings),
            email: self.email.clone(),
            email_from: self.email_from.clone(),
            tokio: self.tokio.clone(),
            deadline,
        });

        let result = context.with(|ctx| evaluate(&ctx, &host, &self.code, &self.context));
        match result {
            Ok(()) => ScriptOutcome::ok(),
            Err(_) if expired.load(Ordering::SeqCst) => ScriptOutcome::failed(
                format!("script timed out after {} ms", self.limits.timeout.as_millis()),
                None,
            ),
            Err(outcome) => outcome,
        }
    }
}

/// Compile `code` as a hook body without running it.
pub(crate) fn check_syntax(code: &str) -> Result<(), ScriptError> {
    let (_runtime, context) = open(SYNTAX_CHECK_MEMORY, None).map_err(|e| ScriptError {
        name: "Error".into(),
        message: format!("script engine unavailable: {}", e),
        line: None,
    })?;
    context.with(|ctx| match ctx.eval::<Value, _>(body(code)).catch(&ctx) {
        Ok(_) => Ok(()),
        Err(CaughtError::Exception(e)) => Err(ScriptError {
            name: exception_name(&e),
            message: e.message().unwrap_or_default(),
            line: error_line(&e),
        }),
        Err(CaughtError::Value(v)) => Err(ScriptError {
            name: "Error".into(),
            message: text_of(&v),
            line: None,
        }),
        Err(CaughtError::Error(e)) => Err(ScriptError {
            name: "Error".into(),
            message: e.to_string(),
            line: None,
        }),
    })
}

fn open(memory: usize, deadline: Option<(Instant, Arc<AtomicBool>)>) -> rquickjs::Result<(Runtime, Context)> {
    let runtime = Runtime::new()?;
    runtime.set_memory_limit(memory);
    runtime.set_max_stack_size(STACK_LIMIT);
    if let Some((deadline, expired)) = deadline {
        runtime.set_interrupt_handler(Some(Box::new(move || {
            let late = Instant::now() >= deadline;
            if late {
                expired.store(true, Ordering::SeqCst);
            }
            late
        })));
    }
    let context = Context::full(&runtime)?;
    Ok((runtime, context))
}

/// User code as the body of an async arrow, so `await` works at the top level. The opening
/// brace shares the first line with the code, so reported lines are the user's.
fn body(code: &str) -> String {
    format!("(async () => {{{}\n}})", code)
}

fn evaluate<'js>(ctx: &Ctx<'js>, host: &Arc<Host>, code: &str, context: &ScriptContext) -> Result<(), ScriptOutcome> {
    install(ctx, host, context).catch(ctx).map_err(failure)?;
    let promise: Promise<'js> = ctx.eval(format!("{}()", body(code))).catch(ctx).map_err(failure)?;
    promise.finish::<Value<'js>>().catch(ctx).map_err(failure)?;
    write_back(ctx, host).catch(ctx).map_err(failure)
}

fn install<'js>(ctx: &Ctx<'js>, host: &Arc<Host>, context: &ScriptContext) -> rquickjs::Result<()> {
    let initial: Vec<(String, Option<Json>)> = lock(&host.bindings)
        .iter()
        .map(|b| (b.variable.clone(), b.written.clone()))
        .collect();
    let variables: Vec<&str> = initial.iter().map(|(v, _)| v.as_str()).collect();
    ctx.eval::<Value, _>(prelude(context, &variables))?;

    let globals = ctx.globals();
    for (variable, value) in &initial {
        globals.set(variable.as_str(), from_json(ctx, value.as_ref())?)?;
    }
    globals.set("getFieldValue", get_field_value(ctx, host.clone())?)?;
    globals.set("setFieldValue", set_field_value(ctx, host.clone())?)?;
    globals.set("sendEmail", send_email(ctx, host.clone())?)?;
    globals.set("console", console(ctx)?)?;
    Ok(())
}

/// Context constants and the `$<variable>` aliases. Every name and value is emitted as a
/// JSON string literal.
fn prelude(context: &ScriptContext, variables: &[&str]) -> String {
    let user_id = context.user_id.as_deref().map(Json::from).unwrap_or(Json::Null);
    let mut src = format!(
        "const userAction = {}, executionMoment = {}, userId = {}, tableId = {};\n",
        Json::from(context.user_action.as_str()),
        Json::from(context.execution_moment.as_str()),
        user_id,
        Json::from(context.table_id.as_str()),
    );
    for variable in variables {
        let name = Json::from(*variable);
        let alias = Json::from(format!("${}", variable));
        src.push_str(&format!(
            "Object.defineProperty(globalThis, {alias}, {{ get: () => globalThis[{name}], set: (v) => {{ globalThis[{name}] = v }} }});\n"
        ));
    }
    src
}

/// Copy changed field variables into the record. Values the host wrote are skipped, so a
/// `setFieldValue` is not undone by a stale variable.
fn write_back<'js>(ctx: &Ctx<'js>, host: &Host) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let bindings: Vec<(String, String, Option<Json>)> = lock(&host.bindings)
        .iter()
        .map(|b| (b.variable.clone(), b.slug.clone(), b.written.clone()))
        .collect();
    for (variable, slug, written) in bindings {
        let current = to_json(ctx, globals.get::<_, Value>(variable.as_str())?)?;
        if current != written {
            lock(&host.row).insert(slug, current.unwrap_or(Json::Null));
        }
    }
    Ok(())
}

fn get_field_value<'js>(ctx: &Ctx<'js>, host: Arc<Host>) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, slug: Coerced<String>| -> rquickjs::Result<Value<'js>> {
            let stored = lock(&host.row).get(&slug.0).cloned();
            match stored {
                None => Ok(Value::new_undefined(ctx)),
                Some(Json::String(text)) => typed_text(&ctx, &text),
                Some(other) => from_json(&ctx, Some(&other)),
            }
        },
    )
}

fn set_field_value<'js>(ctx: &Ctx<'js>, host: Arc<Host>) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, slug: Coerced<String>, value: Opt<Value<'js>>| -> rquickjs::Result<()> {
            let slug = slug.0;
            let json = match value.0 {
                Some(value) => to_json(&ctx, value)?,
                None => None,
            };
            let stored = match json {
                Some(Json::String(text)) => stored_text(text),
                Some(other) => other,
                None => Json::Null,
            };
            lock(&host.row).insert(slug.clone(), stored.clone());

            let bound: Vec<String> = lock(&host.bindings)
                .iter_mut()
                .filter(|b| b.slug == slug)
                .map(|b| {
                    b.written = Some(stored.clone());
                    b.variable.clone()
                })
                .collect();
            let globals = ctx.globals();
            for variable in bound {
                globals.set(variable.as_str(), from_json(&ctx, Some(&stored))?)?;
            }
            Ok(())
        },
    )
}

/// `sendEmail(to, subject, body)` resolves to `{ success, accepted, rejected }` or
/// `{ success: false, error }`; it never throws.
fn send_email<'js>(ctx: &Ctx<'js>, host: Arc<Host>) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              to: Opt<Value<'js>>,
              subject: Opt<Coerced<String>>,
              body: Opt<Coerced<String>>|
              -> rquickjs::Result<Object<'js>> {
            let to = match to.0 {
                Some(value) => recipients(to_json(&ctx, value)?),
                None => Vec::new(),
            };
            let message = EmailMessage {
                to,
                subject: subject.0.map(|s| s.0).unwrap_or_default(),
                body: body.0.map(|s| s.0).unwrap_or_default(),
                from: host.email_from.clone(),
            };
            let reply = Object::new(ctx.clone())?;
            match host.send(message) {
                Ok(receipt) => {
                    reply.set("success", true)?;
                    reply.set("accepted", receipt.accepted)?;
                    reply.set("rejected", receipt.rejected)?;
                }
                Err(error) => {
                    tracing::warn!(target: LOG_TARGET, error = %error, "sendEmail failed");
                    reply.set("success", false)?;
                    reply.set("error", error)?;
                }
            }
            Ok(reply)
        },
    )
}

fn console<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;
    for level in ["log", "info", "debug", "warn", "error"] {
        let log = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
                let mut parts = Vec::with_capacity(args.0.len());
                for arg in args.0 {
                    parts.push(display(&ctx, arg)?);
                }
                let line = parts.join(" ");
                match level {
                    "error" => tracing::error!(target: LOG_TARGET, "{}", line),
                    "warn" => tracing::warn!(target: LOG_TARGET, "{}", line),
                    "debug" => tracing::debug!(target: LOG_TARGET, "{}", line),
                    _ => tracing::info!(target: LOG_TARGET, "{}", line),
                }
                Ok(())
            },
        )?;
        console.set(level, log)?;
    }
    Ok(console)
}

fn display<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<String> {
    if let Some(s) = value.as_string() {
        return s.to_string();
    }
    if value.is_object() && !value.is_function() && value.as_exception().is_none() {
        if let Some(json) = to_json(ctx, value.clone())? {
            return Ok(json.to_string());
        }
    }
    Ok(text_of(&value))
}

fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Option<Json>> {
    match ctx.json_stringify(value)? {
        Some(text) => Ok(serde_json::from_str(&text.to_string()?).ok()),
        None => Ok(None),
    }
}

fn from_json<'js>(ctx: &Ctx<'js>, value: Option<&Json>) -> rquickjs::Result<Value<'js>> {
    match value {
        Some(json) => ctx.json_parse(json.to_string()),
        None => Ok(Value::new_undefined(ctx.clone())),
    }
}

/// Lenient reading of stored text: numbers, booleans and ISO dates come back typed.
fn typed_text<'js>(ctx: &Ctx<'js>, text: &str) -> rquickjs::Result<Value<'js>> {
    let t = text.trim();
    match t {
        "" => {}
        "true" => return true.into_js(ctx),
        "false" => return false.into_js(ctx),
        _ => {
            if let Some(n) = finite_number(t) {
                return n.into_js(ctx);
            }
            if looks_like_date(t) {
                if let Some(at) = parse_timestamp(t) {
                    return ctx.eval(format!("new Date({})", at.timestamp_millis()));
                }
            }
        }
    }
    text.into_js(ctx)
}

/// Text written by `setFieldValue`: numeric and boolean text is stored typed, dates stay text.
fn stored_text(text: String) -> Json {
    let t = text.trim();
    if t == "true" || t == "false" {
        return Json::Bool(t == "true");
    }
    match finite_number(t) {
        Some(n) if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 => Json::from(n as i64),
        Some(n) => serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::String(text)),
        None => Json::String(text),
    }
}

fn finite_number(t: &str) -> Option<f64> {
    t.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn looks_like_date(t: &str) -> bool {
    let b = t.as_bytes();
    b.len() >= 10 && b[4] == b'-' && b[7] == b'-' && b[..4].iter().all(u8::is_ascii_digit)
}

fn recipients(to: Option<Json>) -> Vec<String> {
    match to {
        Some(Json::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Json::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Some(Json::String(list)) => list
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Json::Null) | None => Vec::new(),
        Some(other) => vec![other.to_string()],
    }
}

fn failure(caught: CaughtError<'_>) -> ScriptOutcome {
    match caught {
        CaughtError::Exception(e) => {
            let name = exception_name(&e);
            let message = e.message().unwrap_or_default();
            if name == "SyntaxError" {
                let error = ScriptError {
                    name,
                    message,
                    line: error_line(&e),
                };
                return ScriptOutcome::failed(error.to_string(), None);
            }
            let message = if message.is_empty() { name } else { message };
            ScriptOutcome::failed(message, e.stack().filter(|s| !s.trim().is_empty()))
        }
        CaughtError::Value(v) => ScriptOutcome::failed(text_of(&v), None),
        CaughtError::Error(e) => ScriptOutcome::failed(e.to_string(), None),
    }
}

fn exception_name(e: &Exception<'_>) -> String {
    e.as_object()
        .get::<_, Option<String>>("name")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Error".into())
}

fn text_of(value: &Value<'_>) -> String {
    value
        .get::<Coerced<String>>()
        .map(|s| s.0)
        .unwrap_or_else(|_| "uncaught exception".into())
}

fn error_line(e: &Exception<'_>) -> Option<usize> {
    if let Some(line) = e.as_object().get::<_, Option<i32>>("lineNumber").ok().flatten().filter(|l| *l > 0) {
        return usize::try_from(line).ok();
    }
    e.stack()?.lines().find_map(frame_line)
}

/// Line of a stack frame such as `at f (eval_script:2:7)` or `at eval_script:2`.
fn frame_line(frame: &str) -> Option<usize> {
    let location = frame.trim().trim_end_matches(')');
    let mut parts = location.rsplit(':');
    let last = parts.next()?.parse::<usize>().ok()?;
    match parts.next().and_then(|p| p.parse::<usize>().ok()) {
        Some(line) => Some(line),
        None => Some(last),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
