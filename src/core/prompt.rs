use crate::core::session::{Session, SessionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionKind {
    Agent,
    Skill,
    Tool,
    File,
    Folder,
}

impl MentionKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "agent" => Some(MentionKind::Agent),
            "skill" => Some(MentionKind::Skill),
            "tool" => Some(MentionKind::Tool),
            "file" => Some(MentionKind::File),
            "folder" => Some(MentionKind::Folder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionRef {
    pub kind: MentionKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpandedPrompt {
    /// Input with mention syntax replaced by the readable name and
    /// quoted blocks lifted out.
    pub text: String,
    pub mentions: Vec<MentionRef>,
    /// Decoded quoted/diff-style blocks, prepended as context rather
    /// than left inline.
    pub context_blocks: Vec<String>,
}

/// Expands `@kind:name` mention syntax and lifts `> `-quoted runs out of
/// the prompt body. Plain text passes through untouched.
pub fn expand_mentions(input: &str) -> ExpandedPrompt {
    let mut mentions = Vec::new();
    let mut context_blocks = Vec::new();
    let mut body_lines: Vec<String> = Vec::new();
    let mut quoted_run: Vec<String> = Vec::new();

    for line in input.lines() {
        if let Some(quoted) = line.strip_prefix("> ").or_else(|| line.strip_prefix(">")) {
            quoted_run.push(quoted.to_string());
            continue;
        }
        if !quoted_run.is_empty() {
            context_blocks.push(quoted_run.join("\n"));
            quoted_run.clear();
        }
        body_lines.push(expand_line(line, &mut mentions));
    }
    if !quoted_run.is_empty() {
        context_blocks.push(quoted_run.join("\n"));
    }

    ExpandedPrompt {
        text: body_lines.join("\n").trim().to_string(),
        mentions,
        context_blocks,
    }
}

fn expand_line(line: &str, mentions: &mut Vec<MentionRef>) -> String {
    let mut out = Vec::new();
    for token in line.split(' ') {
        match parse_mention(token) {
            Some((mention, trailing)) => {
                out.push(format!("{}{trailing}", mention.name));
                mentions.push(mention);
            }
            None => out.push(token.to_string()),
        }
    }
    out.join(" ")
}

fn parse_mention(token: &str) -> Option<(MentionRef, &str)> {
    let rest = token.strip_prefix('@')?;
    let (tag, name) = rest.split_once(':')?;
    let kind = MentionKind::from_tag(tag)?;
    // Keep trailing punctuation out of the reference name.
    let end = name
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')))
        .map(|(i, _)| i)
        .unwrap_or(name.len());
    if end == 0 {
        return None;
    }
    let (name, trailing) = name.split_at(end);
    Some((
        MentionRef {
            kind,
            name: name.to_string(),
        },
        trailing,
    ))
}

/// Folds user turns stranded by a prior cancelled generation into the
/// effective prompt, most recent last, blank-line separated.
pub fn merge_stranded_turns(stranded: &[String], input: &str) -> String {
    if stranded.is_empty() {
        return input.to_string();
    }
    let mut merged: Vec<&str> = stranded.iter().map(String::as_str).collect();
    merged.push(input);
    merged.join("\n\n")
}

/// The final prompt offered to the completion engine: context sections
/// first (profile, environment, lifted quoted blocks), then the
/// expanded message text.
pub fn assemble(
    session: &Session,
    expanded: &ExpandedPrompt,
    profile: Option<&str>,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(profile) = profile {
        if !profile.trim().is_empty() {
            sections.push(format!("## Profile\n{}", profile.trim()));
        }
    }

    let mode = match session.mode {
        SessionMode::Plan => "plan",
        SessionMode::Agent => "agent",
    };
    sections.push(format!(
        "## Environment\nworking-dir: {}\nmode: {mode}",
        session.working_dir.display()
    ));

    for block in &expanded.context_blocks {
        sections.push(format!("## Context\n{block}"));
    }

    sections.push(expanded.text.clone());
    sections.join("\n\n")
}
