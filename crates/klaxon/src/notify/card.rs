//! 🎴 Card formatting — turning a pile of log documents into something a
//! human can read on their phone at 3:47 AM without crying. Much.
//!
//! 🧠 Knowledge graph: the card is a Feishu-style interactive card —
//! `msg_type: "interactive"`, red header, title `🚨 ELK 告警`, then one
//! markdown summary block, a divider, and up to [`MAX_CARD_SAMPLES`] sample
//! blocks. The sample fields depend on the *flavor* of log:
//!
//! - **Nginx** access logs: status code, timestamp, request path (query
//!   string stripped, 50-char cap), CF-Ray, domain.
//! - **App** logs (java/go/python/node/etc.): module, node IP, message
//!   (newlines collapsed, 200-char cap), timestamp.
//!
//! Flavor comes from the rule *name* first (people name their rules
//! `prod-nginx-5xx` and `payment-service-errors`, bless them), and falls
//! back to sniffing the first document for a `response_code` field.

use serde_json::{Value, json};

use crate::common::Rule;

/// 📏 At most this many sample blocks make it onto the card. The webhook
/// payload carries up to 10 logs; the card shows the first 3. Phones are small.
pub const MAX_CARD_SAMPLES: usize = 3;

/// 📏 Request paths longer than this get the scissors.
const MAX_REQUEST_CHARS: usize = 50;

/// 📏 App-log messages longer than this get the bigger scissors.
const MAX_MESSAGE_CHARS: usize = 200;

/// 🏷️ Rule-name substrings that mark an app-flavored rule.
const APP_NAME_HINTS: [&str; 12] = [
    "java", "go", "cpp", "c++", "python", "nodejs", "node", "app", "application", "service",
    "api", "web",
];

/// 🎭 The two shapes of log we know how to dress up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFlavor {
    Nginx,
    App,
}

impl LogFlavor {
    /// 🔍 Name first, field-sniffing second.
    pub fn detect(rule_name: &str, samples: &[Value]) -> Self {
        let name = rule_name.to_lowercase();
        if name.contains("nginx") {
            return Self::Nginx;
        }
        if APP_NAME_HINTS.iter().any(|hint| name.contains(hint)) {
            return Self::App;
        }
        // 🕵️ no hint in the name — sniff the first doc for an access-log tell
        match samples.first() {
            Some(doc) if doc.get("response_code").is_some() => Self::Nginx,
            _ => Self::App,
        }
    }
}

/// 🎴 Build the full webhook payload for one alert.
pub fn format_card(rule: &Rule, samples: &[Value], original_count: u64, time_range: &str) -> Value {
    let flavor = LogFlavor::detect(&rule.name, samples);

    let summary = format!(
        "**规则:** {}\n**时间范围:** {}\n**命中数量:** {}\n**索引:** {}",
        rule.name, time_range, original_count, rule.index_pattern
    );

    let mut elements = vec![
        json!({ "tag": "div", "text": { "tag": "lark_md", "content": summary } }),
        json!({ "tag": "hr" }),
    ];
    for doc in samples.iter().take(MAX_CARD_SAMPLES) {
        elements.push(json!({
            "tag": "div",
            "text": { "tag": "lark_md", "content": sample_block(flavor, doc) }
        }));
    }

    json!({
        "msg_type": "interactive",
        "card": {
            "config": { "wide_screen_mode": true },
            "header": {
                "template": "red",
                "title": { "tag": "plain_text", "content": "🚨 ELK 告警" }
            },
            "elements": elements,
        }
    })
}

/// 🎴 One sample log, rendered per flavor.
fn sample_block(flavor: LogFlavor, doc: &Value) -> String {
    match flavor {
        LogFlavor::Nginx => format!(
            "**状态码:** {}  **时间:** {}\n**请求:** {}\n**CF-Ray:** {}  **域名:** {}",
            field(doc, "response_code"),
            field(doc, "@timestamp"),
            truncate_chars(strip_query(&field(doc, "request")), MAX_REQUEST_CHARS),
            field(doc, "cf_ray"),
            field(doc, "domain"),
        ),
        LogFlavor::App => format!(
            "**模块:** {}  **节点:** {}\n**时间:** {}\n**内容:** {}",
            field(doc, "module"),
            field(doc, "node_ip"),
            field(doc, "@timestamp"),
            truncate_chars(&collapse_newlines(&field(doc, "message")), MAX_MESSAGE_CHARS),
        ),
    }
}

/// 🔍 Pull a field as display text. Absent or weird → `-`, because an empty
/// slot on a card reads like a rendering bug and `-` reads like an answer.
fn field(doc: &Value, key: &str) -> String {
    match doc.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => "-".into(),
    }
}

/// ✂️ Drop the query string — `?token=...` has no business on a card.
fn strip_query(request: &str) -> &str {
    request.split('?').next().unwrap_or(request)
}

/// ✂️ Char-boundary-safe truncation. Byte slicing panics on multibyte and
/// these logs are full of multibyte.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

/// 🧹 Stack traces are multiline; cards are not.
fn collapse_newlines(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
