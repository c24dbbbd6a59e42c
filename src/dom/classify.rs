use super::{Document, Element, NodeKey};

const INTERACTIVE_TAGS: &[&str] = &[
    "a", "button", "details", "embed", "input", "label", "menu", "menuitem", "object", "select",
    "textarea", "summary",
];

const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "menu",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "link",
    "checkbox",
    "radio",
    "slider",
    "tab",
    "tabpanel",
    "textbox",
    "combobox",
    "grid",
    "listbox",
    "option",
    "progressbar",
    "scrollbar",
    "searchbox",
    "switch",
    "tree",
    "treeitem",
    "spinbutton",
    "tooltip",
    "dropdown",
];

const CLICK_HANDLER_ATTRS: &[&str] = &["onclick", "ng-click", "@click", "v-on:click"];

const ARIA_STATE_ATTRS: &[&str] = &["aria-expanded", "aria-pressed", "aria-selected", "aria-checked"];

pub(super) fn hidden_by_style(element: &Element) -> bool {
    if element.style_hidden || element.has_attr("hidden") {
        return true;
    }
    if element.attr("aria-hidden") == Some("true") {
        return true;
    }
    let style: String = element
        .attr("style")
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    style.contains("display:none") || style.contains("visibility:hidden")
}

pub(super) fn is_interactive(doc: &Document, key: NodeKey) -> bool {
    let Ok(element) = doc.element(key) else {
        return false;
    };
    if element.tag == "body" {
        return false;
    }

    let parent_is_body = doc
        .parent_element(key)
        .and_then(|p| doc.element(p).ok())
        .is_some_and(|p| p.tag == "body");

    let role = element.attr("role").unwrap_or_default();
    let aria_role = element.attr("aria-role").unwrap_or_default();
    let focusable = element
        .attr("tabindex")
        .and_then(|t| t.trim().parse::<i32>().ok())
        .is_some_and(|t| t >= 0);

    if INTERACTIVE_TAGS.contains(&element.tag.as_str())
        || INTERACTIVE_ROLES.contains(&role)
        || INTERACTIVE_ROLES.contains(&aria_role)
        || (focusable && !parent_is_body)
        || element
            .attr("contenteditable")
            .is_some_and(|v| v.is_empty() || v == "true")
    {
        return true;
    }

    let has_click_handler = CLICK_HANDLER_ATTRS.iter().any(|a| element.has_attr(a));
    let has_aria_state = ARIA_STATE_ATTRS.iter().any(|a| element.has_attr(a));
    let draggable = element.attr("draggable") == Some("true");

    has_click_handler || has_aria_state || draggable
}

#[cfg(test)]
mod tests {
    use crate::dom::{DocumentSpec, el};

    #[test]
    fn test_interactive_classification() {
        let doc = DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body")
                        .child(el("span").attr("tabindex", "0"))
                        .child(
                            el("div")
                                .child(el("span").attr("tabindex", "0"))
                                .child(el("div").attr("role", "tab"))
                                .child(el("div").attr("onclick", "go()"))
                                .child(el("div").attr("tabindex", "-1"))
                                .child(el("a").attr("href", "/x")),
                        ),
                ),
            )
            .build();

        let interactive: Vec<bool> = doc
            .elements()
            .into_iter()
            .map(|k| doc.is_interactive(k))
            .collect();
        // html, body, span(direct child of body), div, span, tab, onclick, tabindex -1, a
        assert_eq!(
            interactive,
            vec![false, false, false, false, true, true, true, false, true]
        );
    }
}
