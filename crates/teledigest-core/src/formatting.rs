//! Formatting utilities: LLM Markdown → Telegram HTML, and splitting HTML into
//! messages that fit the Bot API length limit.

use std::sync::OnceLock;

use regex::Regex;

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Truncate to `max_chars` characters, appending `...` when cut.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

/// Collapse all runs of whitespace (including newlines) into single spaces.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============== Markdown → Telegram HTML ==============

struct InlinePatterns {
    link: Regex,
    bold_stars: Regex,
    bold_underscores: Regex,
    italic_star: Regex,
    italic_underscore: Regex,
}

fn inline_patterns() -> &'static InlinePatterns {
    static PATTERNS: OnceLock<InlinePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| InlinePatterns {
        link: Regex::new(r"\[([^\]\n]+)\]\((https?://[^)\s]+)\)").expect("valid regex"),
        bold_stars: Regex::new(r"\*\*([^*\n]+?)\*\*").expect("valid regex"),
        bold_underscores: Regex::new(r"__([^_\n]+?)__").expect("valid regex"),
        italic_star: Regex::new(r"\*([^*\s][^*\n]*?)\*").expect("valid regex"),
        italic_underscore: Regex::new(r"(^|[\s(])_([^_\n]+?)_($|[\s).,:;!?])")
            .expect("valid regex"),
    })
}

/// Convert the Markdown subset LLMs usually produce into Telegram HTML.
///
/// Telegram accepts only `<b>`, `<i>`, `<code>`, `<pre>`, `<a>`, `<blockquote>`
/// and a few others; everything else is escaped.
pub fn convert_markdown_to_html(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut code_block: Option<Vec<String>> = None;
    let mut quote: Vec<String> = Vec::new();

    for raw in input.lines() {
        let line = raw.trim_end();

        if line.trim_start().starts_with("```") {
            match code_block.take() {
                Some(lines) => out.push(format!("<pre>{}</pre>", lines.join("\n"))),
                None => {
                    flush_quote(&mut out, &mut quote);
                    code_block = Some(Vec::new());
                }
            }
            continue;
        }
        if let Some(lines) = code_block.as_mut() {
            lines.push(escape_html(raw));
            continue;
        }

        if let Some(rest) = line.strip_prefix('>') {
            quote.push(convert_inline(rest.strip_prefix(' ').unwrap_or(rest)));
            continue;
        }
        flush_quote(&mut out, &mut quote);

        let trimmed = line.trim_start();
        if is_horizontal_rule(trimmed) {
            continue;
        }
        if let Some(title) = header_text(trimmed) {
            out.push(format!("<b>{}</b>", convert_inline(title)));
            continue;
        }
        if let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
            .or_else(|| trimmed.strip_prefix("+ "))
        {
            let indent = line.len() - trimmed.len();
            out.push(format!(
                "{}• {}",
                " ".repeat(indent.min(8)),
                convert_inline(item)
            ));
            continue;
        }

        out.push(convert_inline(line));
    }

    flush_quote(&mut out, &mut quote);
    // Unclosed fence: keep what we have as preformatted text.
    if let Some(lines) = code_block {
        out.push(format!("<pre>{}</pre>", lines.join("\n")));
    }

    let mut text = out.join("\n");
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text.trim().to_string()
}

fn flush_quote(out: &mut Vec<String>, quote: &mut Vec<String>) {
    if quote.is_empty() {
        return;
    }
    out.push(format!("<blockquote>{}</blockquote>", quote.join("\n")));
    quote.clear();
}

fn is_horizontal_rule(line: &str) -> bool {
    let compact = line.replace(' ', "");
    compact.len() >= 3
        && (compact.chars().all(|c| c == '-')
            || compact.chars().all(|c| c == '*')
            || compact.chars().all(|c| c == '_'))
}

fn header_text(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    line[hashes..].strip_prefix(' ').map(str::trim)
}

/// Inline Markdown for a single line: backtick spans become `<code>`, the rest
/// is escaped and then gets links and emphasis.
fn convert_inline(line: &str) -> String {
    let segments = line.split('`').collect::<Vec<_>>();
    // An even number of segments means one backtick has no partner.
    let paired = segments.len() % 2 == 1;
    let last = segments.len() - 1;

    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        let is_code = i % 2 == 1 && (paired || i != last);
        if is_code {
            out.push_str("<code>");
            out.push_str(&escape_html(seg));
            out.push_str("</code>");
        } else {
            if i % 2 == 1 {
                out.push('`');
            }
            out.push_str(&convert_emphasis(&escape_html(seg)));
        }
    }
    out
}

fn convert_emphasis(escaped: &str) -> String {
    let p = inline_patterns();
    let s = p.link.replace_all(escaped, r#"<a href="$2">$1</a>"#);
    let s = p.bold_stars.replace_all(&s, "<b>$1</b>");
    let s = p.bold_underscores.replace_all(&s, "<b>$1</b>");
    let s = p.italic_star.replace_all(&s, "<i>$1</i>");
    let s = p.italic_underscore.replace_all(&s, "$1<i>$2</i>$3");
    s.into_owned()
}

// ============== Message splitting ==============

#[derive(Clone, Debug)]
struct OpenTag {
    name: String,
    raw: String,
}

enum Token<'a> {
    Tag(&'a str),
    Text(&'a str),
}

/// Split Telegram HTML into chunks of at most `limit` bytes.
///
/// Each chunk is closed and re-opened at the boundary so every message is
/// valid HTML on its own. Text is cut at newlines or spaces where possible,
/// never inside an entity like `&amp;`.
pub fn split_html_chunks(html: &str, limit: usize) -> Vec<String> {
    if html.len() <= limit {
        return vec![html.to_string()];
    }

    let mut chunks = Vec::new();
    let mut stack: Vec<OpenTag> = Vec::new();
    let mut chunk = String::new();

    for token in tokenize(html) {
        match token {
            Token::Tag(tag) => {
                let mut next_stack = stack.clone();
                apply_tag(&mut next_stack, tag);
                if chunk.len() + tag.len() + closing_len(&next_stack) > limit {
                    flush(&mut chunks, &mut chunk, &stack);
                    reopen(&mut chunk, &stack);
                    if chunk.len() + tag.len() + closing_len(&next_stack) > limit {
                        // Pathological tag that can never fit: drop it.
                        continue;
                    }
                }
                chunk.push_str(tag);
                stack = next_stack;
            }
            Token::Text(mut text) => {
                while !text.is_empty() {
                    let room = limit.saturating_sub(chunk.len() + closing_len(&stack));
                    if text.len() <= room {
                        chunk.push_str(text);
                        break;
                    }
                    let cut = cut_point(text, room);
                    if cut == 0 {
                        if has_content(&chunk, &stack) {
                            flush(&mut chunks, &mut chunk, &stack);
                            reopen(&mut chunk, &stack);
                            continue;
                        }
                        // Nothing fits even in an empty chunk; give up on this text.
                        break;
                    }
                    chunk.push_str(&text[..cut]);
                    text = &text[cut..];
                    flush(&mut chunks, &mut chunk, &stack);
                    reopen(&mut chunk, &stack);
                }
            }
        }
    }

    flush(&mut chunks, &mut chunk, &stack);
    chunks
}

fn tokenize(mut s: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    while !s.is_empty() {
        match s.find('<') {
            Some(0) => match s.find('>') {
                Some(end) => {
                    out.push(Token::Tag(&s[..=end]));
                    s = &s[end + 1..];
                }
                None => {
                    out.push(Token::Text(s));
                    break;
                }
            },
            Some(start) => {
                out.push(Token::Text(&s[..start]));
                s = &s[start..];
            }
            None => {
                out.push(Token::Text(s));
                break;
            }
        }
    }
    out
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn apply_tag(stack: &mut Vec<OpenTag>, tag: &str) {
    let name = tag_name(tag);
    if name.is_empty() || tag.ends_with("/>") {
        return;
    }
    if tag.starts_with("</") {
        if let Some(pos) = stack.iter().rposition(|t| t.name == name) {
            stack.truncate(pos);
        }
    } else {
        stack.push(OpenTag {
            name,
            raw: tag.to_string(),
        });
    }
}

fn closing_len(stack: &[OpenTag]) -> usize {
    stack.iter().map(|t| t.name.len() + 3).sum()
}

fn opening_len(stack: &[OpenTag]) -> usize {
    stack.iter().map(|t| t.raw.len()).sum()
}

fn has_content(chunk: &str, stack: &[OpenTag]) -> bool {
    chunk.len() > opening_len(stack)
}

fn reopen(chunk: &mut String, stack: &[OpenTag]) {
    for t in stack {
        chunk.push_str(&t.raw);
    }
}

fn flush(chunks: &mut Vec<String>, chunk: &mut String, stack: &[OpenTag]) {
    if has_content(chunk, stack) && !chunk.trim().is_empty() {
        let mut msg = std::mem::take(chunk);
        for t in stack.iter().rev() {
            msg.push_str("</");
            msg.push_str(&t.name);
            msg.push('>');
        }
        chunks.push(msg);
    }
    chunk.clear();
}

/// Byte index ≤ `room` to cut `text` at: the last newline, else the last
/// space, else the last char boundary; never inside an HTML entity.
fn cut_point(text: &str, room: usize) -> usize {
    let mut max = room.min(text.len());
    while max > 0 && !text.is_char_boundary(max) {
        max -= 1;
    }
    let head = &text[..max];

    let mut cut = match head.rfind('\n').or_else(|| head.rfind(' ')) {
        Some(i) if i > 0 && i >= max / 2 => i + 1,
        _ => max,
    };

    if let Some(amp) = text[..cut].rfind('&') {
        if !text[amp..cut].contains(';') {
            cut = amp;
        }
    }
    cut
}
