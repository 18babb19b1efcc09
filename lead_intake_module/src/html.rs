use kuchiki::iter::NodeEdge;
use kuchiki::traits::*;
use kuchiki::NodeRef;

/// Flattens an inbound HTML body into matchable plain text.
///
/// Head, style, script and quoted-reply (`blockquote`) blocks are dropped before
/// extraction; block-level boundaries and `<br>` become spaces. Entity decoding
/// is done by the parser.
pub(crate) fn html_to_text(html: &str) -> String {
    let document = kuchiki::parse_html().one(html);
    remove_elements_by_selector(&document, "head, style, script, blockquote");

    let mut out = String::with_capacity(html.len() / 2);
    for edge in document.traverse() {
        match edge {
            NodeEdge::Start(node) => {
                if let Some(text) = node.as_text() {
                    out.push_str(&text.borrow());
                } else if let Some(element) = node.as_element() {
                    if element.name.local.as_ref() == "br" {
                        out.push(' ');
                    }
                }
            }
            NodeEdge::End(node) => {
                if let Some(element) = node.as_element() {
                    if is_block_tag(element.name.local.as_ref()) {
                        out.push(' ');
                    }
                }
            }
        }
    }
    collapse_whitespace(&out)
}

pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn remove_elements_by_selector(document: &NodeRef, selector: &str) {
    let Ok(selection) = document.select(selector) else {
        return;
    };
    let nodes: Vec<NodeRef> = selection.map(|node| node.as_node().clone()).collect();
    for node in nodes {
        node.detach();
    }
}

fn is_block_tag(tag: &str) -> bool {
    matches!(
        tag,
        "p" | "div"
            | "li"
            | "ul"
            | "ol"
            | "tr"
            | "td"
            | "th"
            | "table"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "pre"
            | "address"
    )
}
