use std::sync::Arc;

use crate::step::StepResult;

/// Decides, after a step, whether the run should stop. Receives all completed steps.
pub type StopCondition = Arc<dyn Fn(&[StepResult]) -> bool + Send + Sync>;

/// Stops once `count` steps have completed.
pub fn step_count_is(count: usize) -> StopCondition {
    Arc::new(move |steps: &[StepResult]| steps.len() >= count)
}

/// Stops when the last step called the named tool.
pub fn has_tool_call(tool_name: impl Into<String>) -> StopCondition {
    let tool_name = tool_name.into();
    Arc::new(move |steps: &[StepResult]| {
        steps.last().is_some_and(|step| {
            step.tool_calls()
                .iter()
                .any(|call| call.tool_name == tool_name)
        })
    })
}

/// True when any condition holds.
pub fn is_stop_condition_met(conditions: &[StopCondition], steps: &[StepResult]) -> bool {
    conditions.iter().any(|condition| condition(steps))
}
