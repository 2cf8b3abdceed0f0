//! Heuristic structure flags for model-generated text.

use super::{BoundKeys, Operator, OperatorContext, OperatorSignature};
use crate::models::Result;
use crate::storage::{DATAFRAME_VIEW, RowPolicy, StepStorage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub const NAME: &str = "text_flags";

const ANSWER_MARKERS: &[&str] = &["<answer>", "</answer>", "## Answer", "**Answer**", "\\boxed{"];
const REASONING_MARKERS: &[&str] = &[
    "<reasoning>",
    "<think>",
    "Step 1",
    "First,",
    "Let's think",
    "Let me",
];
const CORRECTION_MARKERS: &[&str] = &[
    "Wait",
    "Actually",
    "Let me reconsider",
    "I made a mistake",
    "Correction:",
    "On second thought",
];

/// Structure annotations for one text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFlags {
    /// Ends mid-sentence or on a dangling connective
    pub truncated: bool,
    pub has_answer_tags: bool,
    pub has_reasoning: bool,
    pub self_correction: bool,
    /// Characters before the first answer marker (whole length if none)
    pub reasoning_length: usize,
}

impl TextFlags {
    pub fn analyze(text: &str) -> Self {
        let trimmed = text.trim_end();

        let truncated = match trimmed.chars().last() {
            None => false,
            Some(last) => {
                !matches!(last, '.' | '!' | '?' | ')' | ']' | '}' | '"' | '\'' | '>' | '*' | '`')
                    || trimmed.ends_with("...")
                    || trimmed.ends_with("Wait")
                    || trimmed.ends_with("Actually")
            }
        };

        let contains_any = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

        let reasoning_length = ["<answer>", "## Answer"]
            .iter()
            .filter_map(|marker| text.find(marker))
            .min()
            .map(|byte| text[..byte].chars().count())
            .unwrap_or_else(|| text.chars().count());

        Self {
            truncated,
            has_answer_tags: contains_any(ANSWER_MARKERS),
            has_reasoning: contains_any(REASONING_MARKERS),
            self_correction: contains_any(CORRECTION_MARKERS),
            reasoning_length,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlagsParams {}

/// Annotates each row with [`TextFlags`].
#[derive(Debug, Clone, Default)]
pub struct TextFlagsOperator;

impl TextFlagsOperator {
    pub fn from_context(ctx: &OperatorContext) -> Result<Self> {
        let _: FlagsParams = ctx.params(NAME)?;
        Ok(Self)
    }
}

#[async_trait]
impl Operator for TextFlagsOperator {
    fn name(&self) -> &str {
        NAME
    }

    fn signature(&self) -> OperatorSignature {
        OperatorSignature::new(RowPolicy::Preserve)
            .input("input", None)
            .output("output", Some("text_flags"))
    }

    async fn run(&self, storage: &StepStorage, keys: &BoundKeys) -> Result<()> {
        let mut dataset = storage.read(DATAFRAME_VIEW)?;
        let input = keys.get("input")?;
        let output = keys.get("output")?;

        let flags: Vec<TextFlags> = dataset.texts(input)?.iter().map(|t| TextFlags::analyze(t)).collect();
        let truncated = flags.iter().filter(|f| f.truncated).count();

        let cells = flags
            .iter()
            .map(|f| serde_json::to_value(f).unwrap_or(Value::Null))
            .collect();

        info!(operator = NAME, rows = flags.len(), truncated, "Flagged rows");
        dataset.set_column(output, cells)?;
        storage.write(&dataset)
    }
}
