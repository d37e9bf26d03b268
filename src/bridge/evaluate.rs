//! Expression evaluation on a paused frame
//!
//! Plain variable and `this` member names are answered by the bridge itself.
//! Anything else goes to an [`ExpressionEvaluator`].

use async_trait::async_trait;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::location::Frame;

/// Compiles and runs expressions against a paused frame
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync + 'static {
    /// Evaluate `expression` with the frame's variables in scope
    ///
    /// `variables` are the scope entries as the sandbox reported them, each
    /// carrying a `name` and a `value`.
    async fn evaluate(&self, frame: &Frame, expression: &str, variables: &[Value]) -> Result<String>;
}

/// Evaluator for hosts without an expression compiler
pub struct NoEvaluator;

#[async_trait]
impl ExpressionEvaluator for NoEvaluator {
    async fn evaluate(&self, frame: &Frame, expression: &str, _variables: &[Value]) -> Result<String> {
        Err(Error::Evaluation(format!(
            "'{}' is not a variable in scope of {}",
            expression, frame.method.name
        )))
    }
}
