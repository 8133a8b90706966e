//! Translation of a practical XPath subset into CSS selectors.
//!
//! Supported:
//!
//! ```text
//! //div/span            descendant and child steps, tag names and *
//! ./span  .//span       steps relative to the context node (:scope)
//! //a[@href]            attribute presence
//! //a[@rel='next']      attribute equality
//! //div[contains(@class,'card')]     substring match
//! //a[starts-with(@href,'/p/')]      prefix match
//! //ul/li[2]  //li[last()]           positional predicates
//! //a/@href  //h1/text()             terminal attribute / text steps
//! ```
//!
//! A position counts siblings of the same tag, or of any tag for `*`, so it
//! must be the first predicate of its step: `li[@class='x'][1]` filters
//! before counting and has no CSS equivalent. Anything else (axes, `.` and
//! `..` on their own, functions over text, boolean operators) is rejected
//! when the schema is compiled.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

/// A translated XPath expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XPathQuery {
    /// Equivalent CSS selector for the element steps.
    pub css: String,
    /// Attribute named by a terminal `@attr` step.
    pub attribute: Option<String>,
}

/// Translate `expr` into an [`XPathQuery`].
pub fn translate(expr: &str) -> Result<XPathQuery, String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("empty XPath expression".into());
    }

    let (relative, path) = match expr.strip_prefix('.') {
        Some(rest) if rest.starts_with('/') => (true, rest),
        Some(_) => return Err(format!("unsupported step '{expr}'")),
        None => (false, expr),
    };

    let steps = split_steps(path)?;
    let last = steps.len() - 1;
    let mut css = if relative { String::from(":scope") } else { String::new() };
    let mut attribute = None;
    let mut element_steps = 0;

    for (i, (axis, step)) in steps.iter().enumerate() {
        let step = step.trim();
        if step == "text()" {
            if i != last {
                return Err("text() is only supported as the final step".into());
            }
            continue;
        }
        if let Some(name) = step.strip_prefix('@') {
            if i != last {
                return Err("@attribute is only supported as the final step".into());
            }
            if !is_name(name) {
                return Err(format!("invalid attribute name '{name}'"));
            }
            attribute = Some(name.to_string());
            continue;
        }

        if element_steps > 0 || relative {
            css.push_str(match axis {
                Axis::Child => " > ",
                Axis::Descendant => " ",
            });
        }
        css.push_str(&translate_element_step(step)?);
        element_steps += 1;
    }

    if element_steps == 0 {
        return Err("expression must select at least one element".into());
    }

    Ok(XPathQuery { css, attribute })
}

/// Split on `/` and `//` outside brackets and quotes.
fn split_steps(expr: &str) -> Result<Vec<(Axis, String)>, String> {
    let mut steps = Vec::new();
    let mut current = String::new();
    let mut axis = Axis::Descendant;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = expr.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ']'".to_string())?;
                current.push(c);
            }
            '/' if depth == 0 => {
                let next_axis = if chars.peek() == Some(&'/') {
                    chars.next();
                    Axis::Descendant
                } else {
                    Axis::Child
                };
                if !current.is_empty() {
                    steps.push((axis, std::mem::take(&mut current)));
                } else if !steps.is_empty() {
                    return Err("empty location step".into());
                }
                axis = next_axis;
            }
            _ => current.push(c),
        }
    }

    if quote.is_some() {
        return Err("unterminated string literal".into());
    }
    if depth != 0 {
        return Err("unbalanced '['".into());
    }
    if current.is_empty() {
        return Err("expression ends with '/'".into());
    }
    steps.push((axis, current));
    Ok(steps)
}

fn translate_element_step(step: &str) -> Result<String, String> {
    let (name, mut rest) = match step.find('[') {
        Some(idx) => (&step[..idx], &step[idx..]),
        None => (step, ""),
    };
    let name = name.trim();
    if name != "*" && !is_name(name) {
        return Err(format!("unsupported step '{step}'"));
    }

    let mut css = name.to_string();
    let mut first = true;
    while !rest.is_empty() {
        let close = matching_bracket(rest).ok_or_else(|| format!("unbalanced predicate in '{step}'"))?;
        css.push_str(&translate_predicate(rest[1..close].trim(), name == "*", first)?);
        first = false;
        rest = rest[close + 1..].trim_start();
        if !rest.is_empty() && !rest.starts_with('[') {
            return Err(format!("unexpected '{rest}' after predicate"));
        }
    }
    Ok(css)
}

fn matching_bracket(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn translate_predicate(pred: &str, any_element: bool, first: bool) -> Result<String, String> {
    let position = match pred.parse::<u32>() {
        Ok(n) => Some(Some(n)),
        Err(_) => (pred == "last()").then_some(None),
    };
    if let Some(index) = position {
        if !first {
            return Err(format!("position [{pred}] must come before other predicates"));
        }
        let family = if any_element { "child" } else { "of-type" };
        return match index {
            Some(0) => Err("XPath positions start at 1".into()),
            Some(n) => Ok(format!(":nth-{family}({n})")),
            None => Ok(format!(":last-{family}")),
        };
    }

    for (func, op) in [("contains(", "*="), ("starts-with(", "^=")] {
        if let Some(args) = pred.strip_prefix(func).and_then(|a| a.strip_suffix(')')) {
            let (attr, literal) = args
                .split_once(',')
                .ok_or_else(|| format!("{func}...) needs two arguments"))?;
            let attr = attr
                .trim()
                .strip_prefix('@')
                .ok_or_else(|| format!("{func}...) only supports attribute arguments"))?;
            if !is_name(attr) {
                return Err(format!("invalid attribute name '{attr}'"));
            }
            let value = unquote(literal.trim())?;
            return Ok(format!("[{attr}{op}\"{}\"]", css_escape(&value)));
        }
    }

    if let Some(body) = pred.strip_prefix('@') {
        return match body.split_once('=') {
            Some((attr, literal)) => {
                let attr = attr.trim();
                if !is_name(attr) {
                    return Err(format!("invalid attribute name '{attr}'"));
                }
                let value = unquote(literal.trim())?;
                Ok(format!("[{attr}=\"{}\"]", css_escape(&value)))
            }
            None if is_name(body.trim()) => Ok(format!("[{}]", body.trim())),
            None => Err(format!("invalid attribute name '{body}'")),
        };
    }

    Err(format!("unsupported predicate '[{pred}]'"))
}

fn unquote(literal: &str) -> Result<String, String> {
    let mut chars = literal.chars();
    match (chars.next(), literal.chars().last()) {
        (Some(open @ ('\'' | '"')), Some(close)) if open == close && literal.len() >= 2 => {
            let inner = &literal[1..literal.len() - 1];
            if inner.contains(open) {
                return Err(format!("unsupported expression '{literal}'"));
            }
            Ok(inner.to_string())
        }
        _ => Err(format!("expected a quoted string, got '{literal}'")),
    }
}

fn css_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
