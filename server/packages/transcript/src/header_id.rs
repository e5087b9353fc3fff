//! Llama-3 style header-id encoding.

use crate::{Role, Turn};

pub(crate) const BEGIN_OF_TEXT: &str = "<|begin_of_text|>";
pub(crate) const START_HEADER: &str = "<|start_header_id|>";
pub(crate) const END_HEADER: &str = "<|end_header_id|>";
pub(crate) const END_OF_TURN: &str = "<|eot_id|>";

pub(crate) const SENTINELS: [&str; 4] = [BEGIN_OF_TEXT, START_HEADER, END_HEADER, END_OF_TURN];

pub(crate) fn is_transcript(raw: &str) -> bool {
    raw.trim_start().starts_with(BEGIN_OF_TEXT)
}

pub(crate) fn decode(blob: &str) -> Vec<Turn> {
    blob.split(END_OF_TURN).filter_map(decode_fragment).collect()
}

fn decode_fragment(fragment: &str) -> Option<Turn> {
    let fragment = fragment.trim();
    let fragment = fragment.strip_prefix(BEGIN_OF_TEXT).unwrap_or(fragment);

    let role_start = fragment.find(START_HEADER)? + START_HEADER.len();
    let role_len = fragment[role_start..].find(END_HEADER)?;
    let role = fragment[role_start..role_start + role_len]
        .trim()
        .parse::<Role>()
        .ok()?;

    let mut content = fragment[role_start + role_len + END_HEADER.len()..].trim();
    if role == Role::System {
        content = content.strip_prefix(BEGIN_OF_TEXT).unwrap_or(content).trim();
    }
    if content.is_empty() {
        return None;
    }
    Some(Turn::new(role, content))
}

pub(crate) fn encode(turns: &[Turn]) -> String {
    let mut blob = String::from(BEGIN_OF_TEXT);
    for (index, turn) in turns.iter().enumerate() {
        if index > 0 {
            blob.push('\n');
            blob.push_str(END_OF_TURN);
            blob.push('\n');
        }
        push_header(&mut blob, turn.role);
        blob.push_str(&turn.content);
    }
    blob.push_str(&turn_header(Role::Assistant));
    blob
}

pub(crate) fn turn_header(role: Role) -> String {
    let mut header = format!("\n{END_OF_TURN}\n");
    push_header(&mut header, role);
    header
}

fn push_header(out: &mut String, role: Role) {
    out.push_str(START_HEADER);
    out.push_str(role.as_str());
    out.push_str(END_HEADER);
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_with_fragments(fragments: &[&str]) -> String {
        let mut blob = String::from(BEGIN_OF_TEXT);
        blob.push_str(&fragments.join(&format!("\n{END_OF_TURN}\n")));
        blob
    }

    #[test]
    fn encodes_fresh_conversation() {
        let blob = encode(&[Turn::system("You are helpful."), Turn::user("What is 8+8?")]);
        insta::assert_snapshot!("encoded_fresh_conversation", blob);
    }

    #[test]
    fn encode_ends_with_open_assistant_header() {
        let blob = encode(&[Turn::user("hi")]);
        assert!(blob.starts_with("<|begin_of_text|><|start_header_id|>user<|end_header_id|>\nhi"));
        assert!(blob.ends_with("\n<|eot_id|>\n<|start_header_id|>assistant<|end_header_id|>\n"));
    }

    #[test]
    fn malformed_fragment_is_skipped() {
        let good = [
            "<|start_header_id|>system<|end_header_id|>\nsys",
            "<|start_header_id|>user<|end_header_id|>\nhello",
        ];
        let with_bad = [
            good[0],
            "no header in this fragment",
            good[1],
        ];
        assert_eq!(
            decode(&blob_with_fragments(&with_bad)),
            decode(&blob_with_fragments(&good))
        );
        assert_eq!(decode(&blob_with_fragments(&good)).len(), 2);
    }

    #[test]
    fn unknown_role_and_empty_content_are_skipped() {
        let blob = blob_with_fragments(&[
            "<|start_header_id|>ipython<|end_header_id|>\nresult",
            "<|start_header_id|>user<|end_header_id|>\n   ",
            "<|start_header_id|>user<|end_header_id|>\nkept",
        ]);
        assert_eq!(decode(&blob), vec![Turn::user("kept")]);
    }

    #[test]
    fn header_end_before_start_is_malformed() {
        let blob = blob_with_fragments(&["user<|end_header_id|><|start_header_id|>\ntext"]);
        assert!(decode(&blob).is_empty());
    }

    #[test]
    fn system_content_loses_redundant_begin_marker() {
        let blob = "<|start_header_id|>system<|end_header_id|>\n<|begin_of_text|>rules<|eot_id|>";
        assert_eq!(decode(blob), vec![Turn::system("rules")]);
    }

    #[test]
    fn decode_trims_role_and_content() {
        let blob = "<|begin_of_text|>\n<|start_header_id|> user <|end_header_id|>\n\n  spaced  \n";
        assert_eq!(decode(blob), vec![Turn::user("spaced")]);
    }

    #[test]
    fn detects_resent_transcript() {
        assert!(is_transcript("<|begin_of_text|><|start_header_id|>"));
        assert!(is_transcript("\n  <|begin_of_text|>"));
        assert!(!is_transcript("What is <|begin_of_text|>?"));
        assert!(!is_transcript("<|begin_of"));
    }

    #[test]
    fn turn_header_closes_previous_turn() {
        assert_eq!(
            turn_header(Role::Tool),
            "\n<|eot_id|>\n<|start_header_id|>tool<|end_header_id|>\n"
        );
    }
}
