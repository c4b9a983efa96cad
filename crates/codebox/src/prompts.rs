use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const PLOT_SUCCESS_MESSAGE: &str = "Plot generated successfully!";

const EXPLAIN_PROMPT: &str = "Explain this Python code in detail:\n\n{code}\n\nFocus on the algorithm, functions, and control flow.";

const REWRITE_PROMPT: &str = "Rewrite this Python code to improve readability and maintainability:\n\n{code}\n\nOnly return the refactored code with no additional text.";

const OPTIMIZE_PROMPT: &str = "Optimize this Python code for performance:\n\n{code}\n\nFirst briefly explain the optimizations, then provide the optimized code.";

const SUGGEST_PROMPT: &str = "Suggest improvements for this Python code:\n\n{code}\n\nInclude potential bug fixes, style improvements, and best practices.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Execute,
    Plot,
    Explain,
    Rewrite,
    Optimize,
    Suggest,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported action '{0}'")]
pub struct ActionParseError(pub String);

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Execute,
        Action::Plot,
        Action::Explain,
        Action::Rewrite,
        Action::Optimize,
        Action::Suggest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Execute => "execute",
            Action::Plot => "plot",
            Action::Explain => "explain",
            Action::Rewrite => "rewrite",
            Action::Optimize => "optimize",
            Action::Suggest => "suggest",
        }
    }

    /// Actions answered by the inference endpoint rather than by running the code.
    pub fn is_generative(self) -> bool {
        self.template().is_some()
    }

    fn template(self) -> Option<&'static str> {
        match self {
            Action::Execute | Action::Plot => None,
            Action::Explain => Some(EXPLAIN_PROMPT),
            Action::Rewrite => Some(REWRITE_PROMPT),
            Action::Optimize => Some(OPTIMIZE_PROMPT),
            Action::Suggest => Some(SUGGEST_PROMPT),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ActionParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        Action::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| ActionParseError(value.to_owned()))
    }
}

/// `None` for `execute` and `plot`, which never reach the model.
pub fn build_prompt(action: Action, code: &str) -> Option<String> {
    action
        .template()
        .map(|template| template.replace("{code}", code))
}
