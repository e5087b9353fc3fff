//! ChatML style markup encoding.

use crate::{Role, Turn};

pub(crate) const IM_START: &str = "<|im_start|>";
pub(crate) const IM_END: &str = "<|im_end|>";

pub(crate) const SENTINELS: [&str; 2] = [IM_START, IM_END];

pub(crate) fn is_transcript(raw: &str) -> bool {
    raw.trim_start().starts_with(IM_START)
}

pub(crate) fn decode(blob: &str) -> Vec<Turn> {
    blob.split(IM_END).filter_map(decode_fragment).collect()
}

fn decode_fragment(fragment: &str) -> Option<Turn> {
    let fragment = fragment.trim();
    let body = &fragment[fragment.find(IM_START)? + IM_START.len()..];
    let (role, content) = body.split_once('\n')?;
    let role = role.trim().parse::<Role>().ok()?;

    let mut content = content.trim();
    if role == Role::System {
        content = content.strip_prefix(IM_START).unwrap_or(content).trim();
    }
    if content.is_empty() {
        return None;
    }
    Some(Turn::new(role, content))
}

pub(crate) fn encode(turns: &[Turn]) -> String {
    let mut blob = String::new();
    for turn in turns {
        blob.push_str(IM_START);
        blob.push_str(turn.role.as_str());
        blob.push('\n');
        blob.push_str(&turn.content);
        blob.push_str(IM_END);
        blob.push('\n');
    }
    blob.push_str(IM_START);
    blob.push_str(Role::Assistant.as_str());
    blob.push('\n');
    blob
}

pub(crate) fn turn_header(role: Role) -> String {
    format!("{IM_END}\n{IM_START}{role}\n")
}
