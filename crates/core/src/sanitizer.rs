//! HTML sanitiser: a hand-written character tokenizer, not a regex.
//!
//! Regex-based HTML processing is a known vulnerability class (catastrophic
//! backtracking, and scheme checks that miss obfuscated forms); this
//! tokenizer walks the input once, tracking open-tag state on a small stack,
//! and never builds a regular expression.

const ALLOWED_TAGS: &[&str] = &[
    "p", "br", "em", "strong", "u", "s", "a", "ul", "ol", "li", "blockquote", "h1", "h2", "h3",
    "h4", "h5", "h6", "code", "pre", "sup", "sub", "span", "div", "hr",
];

const VOID_TAGS: &[&str] = &["br", "hr"];

const DANGEROUS_TAGS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "form", "input", "button", "link", "meta",
    "base", "applet", "math", "svg", "template", "noscript", "xmp", "listing", "plaintext",
    "noembed", "noframes",
];

const ALLOWED_URL_SCHEMES: &[&str] = &["http", "https", "mailto"];

const MAX_TAG_NAME_LEN: usize = 32;

/// Frame pushed for every tag currently open while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TagFrame {
    /// An allow-listed tag we emitted; tracks its lowercase name so the
    /// matching close tag can be verified before being emitted too.
    Allowed(String),
    /// A tag outside the allow-list whose wrapper was stripped but whose
    /// content we keep — its close tag is swallowed without emitting.
    Unknown,
}

/// Sanitize an HTML fragment against the tag/attribute/URL/style allow-lists
/// documented on this module's constants. See `SPEC_FULL.md` §4.2.
pub fn sanitize(html: &str) -> String {
    let chars: Vec<char> = html.chars().collect();
    let mut out = String::with_capacity(html.len());
    let mut stack: Vec<TagFrame> = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        if chars[i] == '<' {
            if starts_with(&chars, i, "<!--") {
                i = skip_comment(&chars, i);
                continue;
            }
            if i + 1 < chars.len() && chars[i + 1] == '/' {
                i = handle_close_tag(&chars, i, &mut stack, &mut out);
                continue;
            }
            i = handle_open_tag(&chars, i, &mut stack, &mut out);
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

/// HTML-escape plain text for safe embedding as a text node or attribute
/// value (`&`, `<`, `>`, `"`, `'`).
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn starts_with(chars: &[char], at: usize, needle: &str) -> bool {
    let needle: Vec<char> = needle.chars().collect();
    at + needle.len() <= chars.len() && chars[at..at + needle.len()] == needle[..]
}

fn skip_comment(chars: &[char], start: usize) -> usize {
    let mut i = start + 4;
    while i < chars.len() && !starts_with(chars, i, "-->") {
        i += 1;
    }
    if i < chars.len() { i + 3 } else { chars.len() }
}

/// Parse a tag name starting right after `<` or `</`, returning it lowercased
/// along with the index right past the name.
fn parse_tag_name(chars: &[char], mut i: usize) -> (String, usize) {
    let mut name = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_alphanumeric() || c == '-' {
            if name.len() <= MAX_TAG_NAME_LEN {
                name.push(c);
            }
            i += 1;
        } else {
            break;
        }
    }
    (name.to_ascii_lowercase(), i)
}

/// Find the index just past the next unescaped `>`, skipping over `>`
/// characters that appear inside quoted attribute values.
fn find_tag_end(chars: &[char], mut i: usize) -> usize {
    let mut in_quote: Option<char> = None;
    while i < chars.len() {
        let c = chars[i];
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => in_quote = Some(c),
            None if c == '>' => return i + 1,
            None => {}
        }
        i += 1;
    }
    chars.len()
}

fn tag_is_self_closing(chars: &[char], end: usize) -> bool {
    end >= 2 && chars.get(end - 2) == Some(&'/')
}

fn handle_close_tag(
    chars: &[char],
    start: usize,
    stack: &mut Vec<TagFrame>,
    out: &mut String,
) -> usize {
    let (name, _) = parse_tag_name(chars, start + 2);
    let end = find_tag_end(chars, start);
    match stack.last() {
        Some(TagFrame::Allowed(top)) if *top == name => {
            stack.pop();
            out.push_str("</");
            out.push_str(&name);
            out.push('>');
        }
        Some(TagFrame::Unknown) => {
            stack.pop();
        }
        _ => {
            // Unbalanced or out-of-order close tag: ignore it rather than
            // emit markup that doesn't match anything we opened.
        }
    }
    end
}

fn handle_open_tag(
    chars: &[char],
    start: usize,
    stack: &mut Vec<TagFrame>,
    out: &mut String,
) -> usize {
    let (name, after_name) = parse_tag_name(chars, start + 1);
    let end = find_tag_end(chars, start);

    if name.is_empty() || name.len() > MAX_TAG_NAME_LEN {
        return end;
    }

    let self_closing = tag_is_self_closing(chars, end);

    if DANGEROUS_TAGS.contains(&name.as_str()) {
        if self_closing {
            return end;
        }
        return skip_dangerous_content(chars, end, &name);
    }

    let attrs = parse_attributes(chars, after_name, end);

    if ALLOWED_TAGS.contains(&name.as_str()) {
        let filtered = filter_attributes(&name, &attrs);
        out.push('<');
        out.push_str(&name);
        for (k, v) in &filtered {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v));
            out.push('"');
        }
        if VOID_TAGS.contains(&name.as_str()) {
            out.push_str(" />");
        } else if self_closing {
            out.push_str("></");
            out.push_str(&name);
            out.push('>');
        } else {
            out.push('>');
            stack.push(TagFrame::Allowed(name));
        }
    } else if !self_closing {
        stack.push(TagFrame::Unknown);
    }

    end
}

/// Scan past a dangerous element's content (and any same-named nested
/// elements) to the end of its matching close tag, dropping it all.
fn skip_dangerous_content(chars: &[char], mut i: usize, tag: &str) -> usize {
    let mut depth = 1usize;
    while i < chars.len() && depth > 0 {
        if chars[i] != '<' {
            i += 1;
            continue;
        }
        if i + 1 < chars.len() && chars[i + 1] == '/' {
            let (name, _) = parse_tag_name(chars, i + 2);
            let tag_end = find_tag_end(chars, i);
            if name == tag {
                depth -= 1;
            }
            i = tag_end;
        } else {
            let (name, _) = parse_tag_name(chars, i + 1);
            let tag_end = find_tag_end(chars, i);
            if name == tag && !tag_is_self_closing(chars, tag_end) {
                depth += 1;
            }
            i = tag_end;
        }
    }
    i
}

type RawAttr = (String, String);

fn parse_attributes(chars: &[char], mut i: usize, end: usize) -> Vec<RawAttr> {
    let mut attrs = Vec::new();
    while i < end {
        while i < end && (chars[i].is_whitespace() || chars[i] == '/') {
            i += 1;
        }
        if i >= end || chars[i] == '>' {
            break;
        }
        let name_start = i;
        while i < end
            && (chars[i].is_ascii_alphanumeric() || chars[i] == '-' || chars[i] == '_' || chars[i] == ':')
        {
            i += 1;
        }
        if i == name_start {
            i += 1;
            continue;
        }
        let name: String = chars[name_start..i]
            .iter()
            .collect::<String>()
            .to_ascii_lowercase();

        let mut j = i;
        while j < end && chars[j].is_whitespace() {
            j += 1;
        }
        if j < end && chars[j] == '=' {
            j += 1;
            while j < end && chars[j].is_whitespace() {
                j += 1;
            }
            let (value, next) = if j < end && (chars[j] == '"' || chars[j] == '\'') {
                let quote = chars[j];
                let vstart = j + 1;
                let mut k = vstart;
                while k < end && chars[k] != quote {
                    k += 1;
                }
                (chars[vstart..k].iter().collect::<String>(), (k + 1).min(end))
            } else {
                let vstart = j;
                let mut k = vstart;
                while k < end && !chars[k].is_whitespace() && chars[k] != '>' {
                    k += 1;
                }
                (chars[vstart..k].iter().collect::<String>(), k)
            };
            attrs.push((name, decode_entities(&value)));
            i = next;
        } else {
            attrs.push((name, String::new()));
            i = j;
        }
    }
    attrs
}

fn filter_attributes(tag: &str, attrs: &[RawAttr]) -> Vec<RawAttr> {
    let mut out = Vec::new();
    for (name, value) in attrs {
        if name.starts_with("on") || name.starts_with("data-") {
            continue;
        }
        match name.as_str() {
            "class" => out.push((name.clone(), value.clone())),
            "style" => {
                let filtered = filter_style(value);
                if !filtered.is_empty() {
                    out.push(("style".into(), filtered));
                }
            }
            "href" if tag == "a" => {
                if is_safe_url(value) {
                    out.push(("href".into(), value.clone()));
                }
            }
            "title" if tag == "a" => out.push(("title".into(), value.clone())),
            _ => {}
        }
    }
    out
}

/// Keep only `text-decoration` and `text-align` declarations with a
/// recognised value; every other CSS property is discarded.
fn filter_style(value: &str) -> String {
    let mut kept = Vec::new();
    for decl in value.split(';') {
        let Some((prop, val)) = decl.split_once(':') else {
            continue;
        };
        let prop = prop.trim().to_ascii_lowercase();
        let val = val.trim().to_ascii_lowercase();
        let ok = match prop.as_str() {
            "text-decoration" => matches!(val.as_str(), "underline" | "overline" | "line-through" | "none"),
            "text-align" => matches!(val.as_str(), "left" | "right" | "center" | "justify" | "end" | "start"),
            _ => false,
        };
        if ok {
            kept.push(format!("{prop}: {val}"));
        }
    }
    kept.join("; ")
}

/// Validate a URL against the scheme allow-list (http/https/mailto) or a
/// relative reference starting with `/`, `#`, or `?`. Protocol-relative
/// (`//…`) URLs are rejected. Control characters and internal whitespace are
/// stripped before the check, which is also why entity decoding happens
/// before this is called: both defeat obfuscated `javascript:` forms.
fn is_safe_url(raw: &str) -> bool {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return false;
    }
    if cleaned.starts_with("//") {
        return false;
    }
    if cleaned.starts_with('/') || cleaned.starts_with('#') || cleaned.starts_with('?') {
        return true;
    }
    match cleaned.split_once(':') {
        Some((scheme, _)) => ALLOWED_URL_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()),
        None => true,
    }
}

/// Decode the handful of HTML entities relevant to unmasking obfuscated URL
/// schemes (`&#x6A;avascript:`). Not a full HTML5 entity table — anything
/// else is left as-is.
fn decode_entities(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '&' {
            if let Some((decoded, next)) = decode_one_entity(&chars, i) {
                out.push(decoded);
                i = next;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn decode_one_entity(chars: &[char], start: usize) -> Option<(char, usize)> {
    let end = (start..chars.len()).find(|&j| chars[j] == ';')?;
    if end - start > 12 {
        return None;
    }
    let body: String = chars[start + 1..end].iter().collect();
    let decoded = match body.as_str() {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        _ if body.starts_with("#x") || body.starts_with("#X") => {
            u32::from_str_radix(&body[2..], 16).ok().and_then(char::from_u32)?
        }
        _ if body.starts_with('#') => body[1..].parse::<u32>().ok().and_then(char::from_u32)?,
        _ => return None,
    };
    Some((decoded, end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_allowed_tags_and_text() {
        assert_eq!(sanitize("<p>hello <strong>world</strong></p>"), "<p>hello <strong>world</strong></p>");
    }

    #[test]
    fn strips_script_and_its_content() {
        assert_eq!(sanitize("<p>a</p><script>alert(1)</script><p>b</p>"), "<p>a</p><p>b</p>");
    }

    #[test]
    fn strips_unknown_tag_but_keeps_content() {
        assert_eq!(sanitize("<marquee>hi</marquee>"), "hi");
    }

    #[test]
    fn drops_comments() {
        assert_eq!(sanitize("a<!-- secret -->b"), "ab");
    }

    #[test]
    fn drops_event_handlers_and_data_attrs() {
        let out = sanitize(r#"<p onclick="evil()" data-x="1">hi</p>"#);
        assert_eq!(out, "<p>hi</p>");
    }

    #[test]
    fn allows_safe_href_and_rejects_javascript_scheme() {
        let safe = sanitize(r#"<a href="https://example.com">x</a>"#);
        assert_eq!(safe, r#"<a href="https://example.com">x</a>"#);

        let unsafe_ = sanitize(r#"<a href="javascript:alert(1)">x</a>"#);
        assert_eq!(unsafe_, "<a>x</a>");
    }

    #[test]
    fn rejects_protocol_relative_url() {
        let out = sanitize(r#"<a href="//evil.example.com">x</a>"#);
        assert_eq!(out, "<a>x</a>");
    }

    #[test]
    fn decodes_entities_before_scheme_check() {
        // &#x6A;avascript: decodes to "javascript:" and must still be rejected.
        let out = sanitize(r#"<a href="&#x6A;avascript:alert(1)">x</a>"#);
        assert_eq!(out, "<a>x</a>");
    }

    #[test]
    fn strips_control_characters_inside_scheme() {
        let out = sanitize("<a href=\"java\nscript:alert(1)\">x</a>");
        assert_eq!(out, "<a>x</a>");
    }

    #[test]
    fn allows_relative_and_fragment_urls() {
        assert_eq!(sanitize(r#"<a href="/photos/1">x</a>"#), r#"<a href="/photos/1">x</a>"#);
        assert_eq!(sanitize(r#"<a href="#top">x</a>"#), r#"<a href="#top">x</a>"#);
    }

    #[test]
    fn filters_style_to_allowed_properties() {
        let out = sanitize(r#"<span style="text-decoration: underline; color: red">x</span>"#);
        assert_eq!(out, r#"<span style="text-decoration: underline">x</span>"#);
    }

    #[test]
    fn drops_tag_with_overlong_name() {
        let long_name = "a".repeat(40);
        let html = format!("<{long_name}>hi</{long_name}>");
        assert_eq!(sanitize(&html), "hi");
    }

    #[test]
    fn escape_produces_safe_entities() {
        assert_eq!(escape("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }

    #[test]
    fn self_closing_allowed_tag_round_trips() {
        assert_eq!(sanitize("<br/>"), "<br />");
        assert_eq!(sanitize("<hr>"), "<hr />");
    }

    #[test]
    fn nested_same_name_dangerous_tag_fully_dropped() {
        let out = sanitize("<p>keep</p><object><object>inner</object>outer</object><p>after</p>");
        assert_eq!(out, "<p>keep</p><p>after</p>");
    }
}
