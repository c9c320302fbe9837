//! Claude -> Gemini model mapping (spec §4.C4 "Claude -> Gemini model
//! mapping"): a pure function of the account's configured table, with one
//! substitution baked in for the thinking variant of the base sonnet model.
//!
//! Grounded on `providers/antigravity/mod.rs::normalize_model_name`'s
//! surrounding call sites, which resolve a mapped model id before building
//! the upstream request; this dispatch engine pushes that resolution out to
//! a pure function the orchestrator calls ahead of the transform so the
//! transform itself stays protocol-shape-only.

use std::collections::BTreeMap;

/// Requested Claude model id that, with thinking enabled, maps to a
/// `-thinking` suffixed variant instead of the account table's base entry.
const BASE_SONNET_MODEL: &str = "claude-sonnet-4-5";
const THINKING_SUFFIX: &str = "-thinking";

/// Decorative prefixes/suffixes some Antigravity IDE builds attach to a
/// model id to flag a synthetic streaming mode ("fake-streaming" and
/// "anti-truncation streaming"); present in CJK in the upstream client and
/// reproduced verbatim here since they're opaque markers, not words to
/// translate.
const FAKE_PREFIX: &str = "\u{5047}\u{6d41}\u{5f0f}/";
const ANTI_TRUNC_PREFIX: &str = "\u{6d41}\u{5f0f}\u{6297}\u{622a}\u{65ad}/";
const FAKE_SUFFIX: &str = "\u{5047}\u{6d41}\u{5f0f}";
const ANTI_TRUNC_SUFFIX: &str = "\u{6d41}\u{5f0f}\u{6297}\u{622a}\u{65ad}";

/// Strips the `models/` resource prefix and the fake-streaming /
/// anti-truncation decorations some client builds attach to the model id
/// before it ever reaches the mapping table.
pub fn normalize_model_name(model: &str) -> String {
    let mut name = model.strip_prefix("models/").unwrap_or(model).trim();
    for prefix in [FAKE_PREFIX, ANTI_TRUNC_PREFIX] {
        if let Some(stripped) = name.strip_prefix(prefix) {
            name = stripped;
        }
    }
    if let Some(stripped) = name.strip_suffix(FAKE_SUFFIX) {
        name = stripped.trim_end_matches('-');
    }
    if let Some(stripped) = name.strip_suffix(ANTI_TRUNC_SUFFIX) {
        name = stripped.trim_end_matches('-');
    }
    name.to_string()
}

/// Resolves `requested_model` through `mapping` (Claude model id -> mapped
/// Gemini model id), normalizing the requested id first. Returns `None`
/// when the model has no entry, which the orchestrator turns into a 403
/// "model not in whitelist".
pub fn map_model(
    mapping: &BTreeMap<String, String>,
    requested_model: &str,
    thinking_enabled: bool,
) -> Option<String> {
    let requested_model = normalize_model_name(requested_model);
    let mapped = mapping.get(&requested_model)?.clone();
    if thinking_enabled && requested_model == BASE_SONNET_MODEL && !mapped.ends_with(THINKING_SUFFIX) {
        return Some(format!("{mapped}{THINKING_SUFFIX}"));
    }
    Some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("claude-sonnet-4-5".to_string(), "gemini-3-pro".to_string()),
            ("claude-haiku-4-5".to_string(), "gemini-3-flash".to_string()),
        ])
    }

    #[test]
    fn unmapped_model_returns_none() {
        assert_eq!(map_model(&table(), "claude-opus-4", false), None);
    }

    #[test]
    fn plain_lookup_without_thinking() {
        assert_eq!(
            map_model(&table(), "claude-sonnet-4-5", false).as_deref(),
            Some("gemini-3-pro")
        );
    }

    #[test]
    fn normalize_strips_resource_prefix() {
        assert_eq!(normalize_model_name("models/claude-sonnet-4-5"), "claude-sonnet-4-5");
    }

    #[test]
    fn normalize_strips_fake_streaming_decoration() {
        let decorated = format!("{FAKE_PREFIX}claude-sonnet-4-5-{FAKE_SUFFIX}");
        assert_eq!(normalize_model_name(&decorated), "claude-sonnet-4-5");
    }

    #[test]
    fn map_model_normalizes_before_lookup() {
        let decorated = format!("models/{ANTI_TRUNC_PREFIX}claude-haiku-4-5");
        assert_eq!(map_model(&table(), &decorated, false).as_deref(), Some("gemini-3-flash"));
    }

    #[test]
    fn thinking_enabled_substitutes_thinking_variant_for_base_sonnet_only() {
        assert_eq!(
            map_model(&table(), "claude-sonnet-4-5", true).as_deref(),
            Some("gemini-3-pro-thinking")
        );
        assert_eq!(
            map_model(&table(), "claude-haiku-4-5", true).as_deref(),
            Some("gemini-3-flash"),
        );
    }
}
