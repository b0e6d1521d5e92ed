//! i18n marker resolution.
//!
//! A reply text beginning with `t:<key>` (optionally followed by
//! `{k1=v1, k2=v2}` placeholders) is looked up in the per-(bot, locale, key)
//! table. Locale preference order: user → chat → bot default → `ru`.
//! A missing key resolves to the literal marker so missing translations are
//! visible in tests instead of silently blank.

use uuid::Uuid;

use crate::db::Repo;
use crate::template::{self, Scope};

/// Parsed `t:key {a=x, b=y}` marker.
#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    pub key: String,
    pub args: Scope,
}

/// Parse a marker; returns `None` when `text` is not marker-shaped (callers
/// then use the text as-is).
pub fn parse_marker(text: &str) -> Option<Marker> {
    let rest = text.strip_prefix("t:")?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    let (key, args_part) = match rest.find('{') {
        Some(pos) => (rest[..pos].trim(), Some(rest[pos..].trim())),
        None => (rest, None),
    };
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let mut args = Scope::new();
    if let Some(block) = args_part {
        let inner = block.strip_prefix('{')?.strip_suffix('}')?;
        for pair in inner.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=')?;
            args.insert(
                k.trim().to_string(),
                serde_json::Value::String(v.trim().to_string()),
            );
        }
    }
    Some(Marker {
        key: key.to_string(),
        args,
    })
}

/// Locale lookup + key resolution over the repository.
#[derive(Clone)]
pub struct I18nResolver {
    repo: Repo,
}

impl I18nResolver {
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    /// Preference chain: user → chat → bot default → `ru`. Lookup errors fall
    /// through to the next source.
    pub async fn locale_for(
        &self,
        bot_id: Uuid,
        bot_default: &str,
        user_id: Option<i64>,
        chat_id: Option<i64>,
    ) -> String {
        if let Some(uid) = user_id {
            if let Ok(Some(locale)) = self.repo.user_locale(bot_id, uid).await {
                return locale;
            }
        }
        if let Some(cid) = chat_id {
            if let Ok(Some(locale)) = self.repo.chat_locale(bot_id, cid).await {
                return locale;
            }
        }
        if !bot_default.is_empty() {
            return bot_default.to_string();
        }
        "ru".to_string()
    }

    /// Resolve `text` if it is a marker; otherwise return it unchanged.
    pub async fn resolve(
        &self,
        bot_id: Uuid,
        bot_default: &str,
        user_id: Option<i64>,
        chat_id: Option<i64>,
        text: &str,
    ) -> String {
        let Some(marker) = parse_marker(text) else {
            return text.to_string();
        };
        let locale = self.locale_for(bot_id, bot_default, user_id, chat_id).await;
        let value = match self.repo.i18n_value(bot_id, &locale, &marker.key).await {
            Ok(Some(v)) => v,
            _ => return text.to_string(),
        };
        match template::render(&value, &marker.args, None) {
            Ok(rendered) => rendered,
            Err(e) => e.fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemorySql, Row, SqlOutcome};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn parse_plain_marker() {
        let m = parse_marker("t:greeting").unwrap();
        assert_eq!(m.key, "greeting");
        assert!(m.args.is_empty());
    }

    #[test]
    fn parse_marker_with_args() {
        let m = parse_marker("t:booked {service=massage, slot=14:00}").unwrap();
        assert_eq!(m.key, "booked");
        assert_eq!(m.args["service"], "massage");
        assert_eq!(m.args["slot"], "14:00");
    }

    #[test]
    fn non_markers_pass_through() {
        assert!(parse_marker("hello").is_none());
        assert!(parse_marker("t:").is_none());
        assert!(parse_marker("t:two words").is_none());
        assert!(parse_marker("t:key {broken").is_none());
    }

    fn row(col: &str, value: &str) -> Row {
        let mut r = Row::new();
        r.insert(col.into(), json!(value));
        r
    }

    fn resolver_with(
        user_locale: Option<&'static str>,
        chat_locale: Option<&'static str>,
        value: Option<&'static str>,
    ) -> I18nResolver {
        let runner = InMemorySql::with_handler(move |sql, _binds| {
            if sql.contains("FROM locales") && sql.contains("user_id") {
                Ok(SqlOutcome::Rows(
                    user_locale.map(|l| vec![row("locale", l)]).unwrap_or_default(),
                ))
            } else if sql.contains("FROM locales") {
                Ok(SqlOutcome::Rows(
                    chat_locale.map(|l| vec![row("locale", l)]).unwrap_or_default(),
                ))
            } else if sql.contains("FROM i18n_keys") {
                Ok(SqlOutcome::Rows(
                    value.map(|v| vec![row("value", v)]).unwrap_or_default(),
                ))
            } else {
                Ok(SqlOutcome::Rows(vec![]))
            }
        });
        I18nResolver::new(Repo::new(Arc::new(runner)))
    }

    #[tokio::test]
    async fn user_preference_wins() {
        let r = resolver_with(Some("en"), Some("de"), None);
        let locale = r.locale_for(Uuid::new_v4(), "ru", Some(1), Some(2)).await;
        assert_eq!(locale, "en");
    }

    #[tokio::test]
    async fn falls_through_chat_then_default_then_ru() {
        let r = resolver_with(None, Some("de"), None);
        assert_eq!(r.locale_for(Uuid::new_v4(), "ru", Some(1), Some(2)).await, "de");

        let r = resolver_with(None, None, None);
        assert_eq!(r.locale_for(Uuid::new_v4(), "kk", Some(1), Some(2)).await, "kk");
        assert_eq!(r.locale_for(Uuid::new_v4(), "", None, None).await, "ru");
    }

    #[tokio::test]
    async fn marker_resolves_and_substitutes() {
        let r = resolver_with(None, None, Some("Забронировано: {{service}}"));
        let out = r
            .resolve(Uuid::new_v4(), "ru", Some(1), None, "t:booked {service=massage}")
            .await;
        assert_eq!(out, "Забронировано: massage");
    }

    #[tokio::test]
    async fn missing_key_returns_literal_marker() {
        let r = resolver_with(None, None, None);
        let out = r.resolve(Uuid::new_v4(), "ru", Some(1), None, "t:nope").await;
        assert_eq!(out, "t:nope");
    }

    #[tokio::test]
    async fn plain_text_unchanged() {
        let r = resolver_with(None, None, None);
        let out = r.resolve(Uuid::new_v4(), "ru", None, None, "Hi!").await;
        assert_eq!(out, "Hi!");
    }
}
