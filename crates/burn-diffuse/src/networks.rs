//! Extra-network prompt syntax.
//!
//! Prompts may carry `<kind:name:arg...>` tags selecting additional
//! networks (LoRA weights, hypernetworks and similar). The tags are
//! stripped before text conditioning; the collected data activates the
//! networks for the duration of the batch and feeds the conditioning-cache
//! key so cached tensors are not reused across different network sets.

use std::collections::BTreeMap;

/// Positional arguments of one parsed tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraNetworkParams {
    pub items: Vec<String>,
}

/// Parsed tags grouped by network kind.
pub type ExtraNetworkData = BTreeMap<String, Vec<ExtraNetworkParams>>;

/// Strips network tags from one prompt. Malformed tags (no closing
/// bracket, empty or non-word kind, missing arguments) stay in the text.
pub fn parse_prompt(prompt: &str) -> (String, ExtraNetworkData) {
    let mut out = String::with_capacity(prompt.len());
    let mut data = ExtraNetworkData::new();
    let mut rest = prompt;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        match parse_tag(candidate) {
            Some((kind, params, consumed)) => {
                data.entry(kind).or_default().push(params);
                rest = &candidate[consumed..];
            }
            None => {
                out.push('<');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    (out, data)
}

/// Strips network tags from every prompt of a batch; the returned data
/// comes from the first prompt, which defines the networks for the batch.
pub fn parse_prompts(prompts: &[String]) -> (Vec<String>, ExtraNetworkData) {
    let mut stripped = Vec::with_capacity(prompts.len());
    let mut data: Option<ExtraNetworkData> = None;
    for prompt in prompts {
        let (text, parsed) = parse_prompt(prompt);
        if data.is_none() {
            data = Some(parsed);
        }
        stripped.push(text);
    }
    (stripped, data.unwrap_or_default())
}

/// Canonical string form of the parsed data, used in cache keys.
pub fn fingerprint(data: &ExtraNetworkData) -> String {
    let mut parts = Vec::new();
    for (kind, entries) in data {
        for entry in entries {
            parts.push(format!("{}:{}", kind, entry.items.join(":")));
        }
    }
    parts.join(";")
}

fn parse_tag(candidate: &str) -> Option<(String, ExtraNetworkParams, usize)> {
    let end = candidate.find('>')?;
    let inner = &candidate[1..end];
    let (kind, args) = inner.split_once(':')?;
    if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    if args.is_empty() {
        return None;
    }
    let items = args.split(':').map(str::to_string).collect();
    Some((kind.to_string(), ExtraNetworkParams { items }, end + 1))
}
