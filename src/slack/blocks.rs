//! Slack Block Kit builders for kernel output.

use slack_morphism::prelude::{SlackBlock, SlackBlockText, SlackSectionBlock};

/// Wrap `text` in a fenced code block.
#[must_use]
pub fn code_fence(text: &str) -> String {
    format!("```{text}```")
}

/// Section block rendering `text` as a code block.
#[must_use]
pub fn code_section(text: &str) -> SlackBlock {
    SlackBlock::Section(
        SlackSectionBlock::new().with_text(SlackBlockText::MarkDown(code_fence(text).into())),
    )
}
