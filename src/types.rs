use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Pixels scrolled when a scroll action carries no amount.
pub const DEFAULT_SCROLL_AMOUNT: i64 = 400;

/// Hints a planned action uses to identify its target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", alias = "selector")]
    #[serde(deserialize_with = "one_or_many")]
    pub selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "xpath")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl Locator {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn by_selector(selector: &str) -> Self {
        Self {
            selectors: vec![selector.to_string()],
            ..Default::default()
        }
    }

    pub fn by_path(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            ..Default::default()
        }
    }

    pub fn by_text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    /// True when no hint carries any content.
    pub fn is_empty(&self) -> bool {
        let blank = |s: &Option<String>| s.as_deref().is_none_or(|v| v.trim().is_empty());
        blank(&self.id)
            && blank(&self.path)
            && blank(&self.text)
            && self.selectors.iter().all(|s| s.trim().is_empty())
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(id) = &self.id {
            parts.push(format!("id={id}"));
        }
        for s in &self.selectors {
            parts.push(format!("selector={s}"));
        }
        if let Some(p) = &self.path {
            parts.push(format!("path={p}"));
        }
        if let Some(t) = &self.text {
            parts.push(format!("text={t:?}"));
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    #[error("unknown action type '{0}'")]
    UnknownType(String),

    #[error("{kind} action is missing {field}")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("malformed action: {0}")]
    Malformed(String),
}

/// One instruction from the planner. Required fields are checked at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", try_from = "RawAction")]
pub enum PlannedAction {
    Click { target: Locator },
    Input { target: Locator, text: String },
    Scroll { target: Locator, amount: i64 },
    Navigate { url: String },
}

impl PlannedAction {
    pub fn click(target: Locator) -> Result<Self, ActionError> {
        require_target("click", &target)?;
        Ok(Self::Click { target })
    }

    pub fn input(target: Locator, text: impl Into<String>) -> Result<Self, ActionError> {
        require_target("input", &target)?;
        Ok(Self::Input {
            target,
            text: text.into(),
        })
    }

    pub fn scroll(target: Locator, amount: i64) -> Result<Self, ActionError> {
        require_target("scroll", &target)?;
        Ok(Self::Scroll { target, amount })
    }

    pub fn navigate(url: impl Into<String>) -> Result<Self, ActionError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ActionError::MissingField {
                kind: "navigate",
                field: "url",
            });
        }
        Ok(Self::Navigate { url })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Input { .. } => "input",
            Self::Scroll { .. } => "scroll",
            Self::Navigate { .. } => "navigate",
        }
    }

    pub fn target(&self) -> Option<&Locator> {
        match self {
            Self::Click { target } | Self::Input { target, .. } | Self::Scroll { target, .. } => {
                Some(target)
            }
            Self::Navigate { .. } => None,
        }
    }
}

fn require_target(kind: &'static str, target: &Locator) -> Result<(), ActionError> {
    if target.is_empty() {
        return Err(ActionError::MissingField {
            kind,
            field: "target",
        });
    }
    Ok(())
}

/// Loose shape of an action on the wire, before validation.
#[derive(Debug, Clone, Deserialize)]
struct RawAction {
    #[serde(rename = "type", alias = "action")]
    kind: String,
    #[serde(default, alias = "locator")]
    target: Option<Locator>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    element_id: Option<String>,
    #[serde(default)]
    xpath_ref: Option<String>,
    #[serde(default)]
    selector: Option<String>,
}

impl RawAction {
    /// The nested target, or one assembled from the flat `element_id`/`xpath_ref`/`selector`
    /// fields. For clicks a flat `text` describes the target.
    fn locator(&mut self, click: bool) -> Locator {
        if let Some(target) = self.target.take() {
            return target;
        }
        Locator {
            id: self.element_id.take(),
            selectors: self.selector.take().into_iter().collect(),
            path: self.xpath_ref.take(),
            text: if click { self.text.clone() } else { None },
        }
    }
}

impl TryFrom<RawAction> for PlannedAction {
    type Error = ActionError;

    fn try_from(mut raw: RawAction) -> Result<Self, Self::Error> {
        match raw.kind.to_ascii_lowercase().replace('-', "_").as_str() {
            "click" => Self::click(raw.locator(true)),
            "input" | "type" | "text_entry" => {
                let target = raw.locator(false);
                let text = raw.text.ok_or(ActionError::MissingField {
                    kind: "input",
                    field: "text",
                })?;
                Self::input(target, text)
            }
            "scroll" => Self::scroll(
                raw.locator(false),
                raw.amount.unwrap_or(DEFAULT_SCROLL_AMOUNT),
            ),
            "navigate" | "url" => Self::navigate(raw.url.unwrap_or_default()),
            _ => Err(ActionError::UnknownType(raw.kind)),
        }
    }
}

/// A planner action slot: either a valid action or the reason it was rejected. Keeping
/// rejected slots preserves one result per planner action.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    Action(PlannedAction),
    Rejected { raw: Value, error: ActionError },
}

impl From<PlannedAction> for PlanStep {
    fn from(action: PlannedAction) -> Self {
        PlanStep::Action(action)
    }
}

impl From<Value> for PlanStep {
    fn from(raw: Value) -> Self {
        let parsed = serde_json::from_value::<RawAction>(raw.clone())
            .map_err(|e| ActionError::Malformed(e.to_string()))
            .and_then(PlannedAction::try_from);
        match parsed {
            Ok(action) => PlanStep::Action(action),
            Err(error) => PlanStep::Rejected { raw, error },
        }
    }
}

impl<'de> Deserialize<'de> for PlanStep {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(PlanStep::from)
    }
}

impl Serialize for PlanStep {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            PlanStep::Action(action) => action.serialize(serializer),
            PlanStep::Rejected { raw, .. } => raw.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

/// Fine-grained progress of the current iteration, used to spot stuck work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Idle,
    Parsing,
    Updating,
    ExecutingActions,
    WaitingForServer,
    Completed,
    Error,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub iteration: u32,
    pub paused: bool,
    pub last_origin: Option<String>,
    pub processing: ProcessingStatus,
}

impl Task {
    /// A fresh idle task with a locally minted id.
    pub fn fresh() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: String::new(),
            status: TaskStatus::Idle,
            iteration: 0,
            paused: false,
            last_origin: None,
            processing: ProcessingStatus::Idle,
        }
    }
}

/// The most recent planning round, as remembered between ticks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningRecord {
    pub iteration: u32,
    pub is_done: bool,
    pub results: Vec<ActionResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_actions_from_wire() {
        let step = PlanStep::from(json!({"type": "click", "target": {"id": "submit"}}));
        assert_eq!(
            step,
            PlanStep::Action(PlannedAction::click(Locator::by_id("submit")).unwrap())
        );

        let step = PlanStep::from(json!({
            "type": "input",
            "target": {"selector": "#q"},
            "text": "rust"
        }));
        match step {
            PlanStep::Action(PlannedAction::Input { target, text }) => {
                assert_eq!(target.selectors, vec!["#q".to_string()]);
                assert_eq!(text, "rust");
            }
            other => panic!("unexpected {other:?}"),
        }

        let step = PlanStep::from(json!({"type": "url", "url": "https://example.test/"}));
        assert!(matches!(step, PlanStep::Action(PlannedAction::Navigate { .. })));

        let step = PlanStep::from(json!({"type": "scroll", "target": {"xpath": "/html/body"}}));
        assert!(matches!(
            step,
            PlanStep::Action(PlannedAction::Scroll {
                amount: DEFAULT_SCROLL_AMOUNT,
                ..
            })
        ));
    }

    #[test]
    fn test_flat_locator_fields() {
        let step = PlanStep::from(json!({
            "type": "click",
            "element_id": "buy",
            "xpath_ref": "/html/body/button",
            "text": "Buy now"
        }));
        let PlanStep::Action(PlannedAction::Click { target }) = step else {
            panic!("expected click");
        };
        assert_eq!(target.id.as_deref(), Some("buy"));
        assert_eq!(target.path.as_deref(), Some("/html/body/button"));
        assert_eq!(target.text.as_deref(), Some("Buy now"));

        let step = PlanStep::from(json!({"type": "input", "selector": "#q", "text": "rust"}));
        let PlanStep::Action(PlannedAction::Input { target, text }) = step else {
            panic!("expected input");
        };
        assert_eq!(target.selectors, vec!["#q".to_string()]);
        assert_eq!(target.text, None);
        assert_eq!(text, "rust");
    }

    #[test]
    fn test_rejected_steps() {
        let step = PlanStep::from(json!({"type": "hover", "target": {"id": "x"}}));
        assert!(matches!(
            step,
            PlanStep::Rejected {
                error: ActionError::UnknownType(_),
                ..
            }
        ));

        let step = PlanStep::from(json!({"type": "input", "target": {"id": "x"}}));
        assert!(matches!(
            step,
            PlanStep::Rejected {
                error: ActionError::MissingField { field: "text", .. },
                ..
            }
        ));

        let step = PlanStep::from(json!({"type": "click", "target": {"id": "  "}}));
        assert!(matches!(step, PlanStep::Rejected { .. }));

        let step = PlanStep::from(json!("click"));
        assert!(matches!(
            step,
            PlanStep::Rejected {
                error: ActionError::Malformed(_),
                ..
            }
        ));
    }

    #[test]
    fn test_constructors_enforce_fields() {
        assert!(PlannedAction::click(Locator::default()).is_err());
        assert!(PlannedAction::navigate("").is_err());
        assert!(PlannedAction::input(Locator::by_text("Search"), "").is_ok());
    }

    #[test]
    fn test_action_serializes_with_type_tag() {
        let action = PlannedAction::navigate("https://example.test/").unwrap();
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "navigate");
        let back: PlannedAction = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }
}
