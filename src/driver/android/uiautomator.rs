use anyhow::Result;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::sync::OnceLock;

fn numeric_entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&#(x[0-9A-Fa-f]+|\d+);").expect("valid entity regex"))
}

/// Decode the HTML entities uiautomator leaves in attribute values
fn decode_html_entities(s: &str) -> String {
    let named = s
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");

    numeric_entity_re()
        .replace_all(&named, |caps: &regex::Captures| {
            let code = &caps[1];
            let value = match code.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => code.parse::<u32>().ok(),
            };
            value
                .and_then(char::from_u32)
                .map(|c| c.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}

/// A node of the view hierarchy, reduced to what text lookup needs
#[derive(Debug, Clone, Default)]
pub struct UiElement {
    pub class: String,
    pub text: String,
    pub content_desc: String,
    pub hint: String,
    pub bounds: Bounds,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    /// Parse bounds from string like "[0,0][1080,1920]"
    pub fn from_string(s: &str) -> Option<Self> {
        let (lt, rb) = s.trim().split_once("][")?;
        let (left, top) = lt.trim_start_matches('[').split_once(',')?;
        let (right, bottom) = rb.trim_end_matches(']').split_once(',')?;
        Some(Bounds {
            left: left.trim().parse().ok()?,
            top: top.trim().parse().ok()?,
            right: right.trim().parse().ok()?,
            bottom: bottom.trim().parse().ok()?,
        })
    }
}

/// Parse UI hierarchy XML from uiautomator dump
pub fn parse_hierarchy(xml: &str) -> Result<Vec<UiElement>> {
    let mut elements = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) if e.name().as_ref() == b"node" => {
                let mut element = UiElement {
                    enabled: true,
                    ..Default::default()
                };

                for attr in e.attributes().filter_map(|a| a.ok()) {
                    let value = String::from_utf8_lossy(&attr.value);
                    match attr.key.as_ref() {
                        b"class" => element.class = value.to_string(),
                        b"text" => element.text = decode_html_entities(&value),
                        b"content-desc" => element.content_desc = decode_html_entities(&value),
                        b"hint" => element.hint = decode_html_entities(&value),
                        b"bounds" => {
                            if let Some(b) = Bounds::from_string(&value) {
                                element.bounds = b;
                            }
                        }
                        b"enabled" => element.enabled = value == "true",
                        _ => {}
                    }
                }

                elements.push(element);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                anyhow::bail!(
                    "XML parse error at position {}: {}",
                    reader.buffer_position(),
                    e
                );
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(elements)
}

/// Normalize text: replace NBSP with space, trim whitespace
fn normalize_text(s: &str) -> String {
    s.replace('\u{00A0}', " ").trim().to_string()
}

/// Find the first on-screen element whose text, content-desc or hint matches.
///
/// Exact (normalized) matches win over case-insensitive ones.
pub fn find_by_text<'a>(elements: &'a [UiElement], text: &str) -> Option<&'a UiElement> {
    let wanted = normalize_text(text);
    let labels = |e: &'a UiElement| {
        [&e.text, &e.content_desc, &e.hint]
            .into_iter()
            .map(|s| normalize_text(s))
    };
    let visible = elements.iter().filter(|e| !e.bounds.is_empty());

    visible
        .clone()
        .find(|e| labels(e).any(|l| l == wanted))
        .or_else(|| {
            let wanted_lower = wanted.to_lowercase();
            visible
                .clone()
                .find(|e| labels(e).any(|l| l.to_lowercase() == wanted_lower))
        })
}
