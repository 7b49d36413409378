use std::collections::{HashMap, HashSet};

use crate::content::ToolCall;
use crate::message::{AssistantPart, ModelMessage, ToolMessagePart};
use crate::tool::ToolSet;

/// A call the user approved in the previous turn.
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovedCall {
    pub approval_id: String,
    pub tool_call: ToolCall,
}

/// A call the user denied in the previous turn.
#[derive(Clone, Debug, PartialEq)]
pub struct DeniedCall {
    pub approval_id: String,
    pub tool_call: ToolCall,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectedApprovals {
    pub approved: Vec<ApprovedCall>,
    pub denied: Vec<DeniedCall>,
}

impl CollectedApprovals {
    pub fn is_empty(&self) -> bool {
        self.approved.is_empty() && self.denied.is_empty()
    }
}

/// Pairs approval responses in the trailing tool message with the approval
/// requests and tool calls of earlier assistant messages.
///
/// Only applies when the history ends with a tool message. Calls that already
/// have a result are skipped, so each approval id is acted on once.
pub fn collect_tool_approvals(messages: &[ModelMessage], tools: &ToolSet) -> CollectedApprovals {
    let Some(ModelMessage::Tool { content: last }) = messages.last() else {
        return CollectedApprovals::default();
    };

    let mut calls = HashMap::new();
    let mut requests = HashMap::new();
    let mut answered = HashSet::new();
    for message in messages {
        match message {
            ModelMessage::Assistant { content } => {
                for part in content {
                    match part {
                        AssistantPart::ToolCall {
                            tool_call_id,
                            tool_name,
                            input,
                            provider_executed,
                        } => {
                            calls.insert(
                                tool_call_id.clone(),
                                ToolCall {
                                    tool_call_id: tool_call_id.clone(),
                                    tool_name: tool_name.clone(),
                                    input: input.clone(),
                                    dynamic: tools
                                        .get(tool_name)
                                        .is_none_or(|tool| tool.is_dynamic()),
                                    provider_executed: provider_executed.unwrap_or(false),
                                    invalid: false,
                                    error: None,
                                    provider_metadata: None,
                                },
                            );
                        }
                        AssistantPart::ToolApprovalRequest {
                            approval_id,
                            tool_call_id,
                        } => {
                            requests.insert(approval_id.clone(), tool_call_id.clone());
                        }
                        AssistantPart::ToolResult { tool_call_id, .. } => {
                            answered.insert(tool_call_id.clone());
                        }
                        _ => {}
                    }
                }
            }
            ModelMessage::Tool { content } => {
                for part in content {
                    if let ToolMessagePart::ToolResult { tool_call_id, .. } = part {
                        answered.insert(tool_call_id.clone());
                    }
                }
            }
            _ => {}
        }
    }

    let mut collected = CollectedApprovals::default();
    for part in last {
        let ToolMessagePart::ToolApprovalResponse {
            approval_id,
            approved,
            reason,
        } = part
        else {
            continue;
        };
        let Some(tool_call) = requests
            .get(approval_id)
            .and_then(|tool_call_id| calls.get(tool_call_id))
        else {
            continue;
        };
        if answered.contains(&tool_call.tool_call_id) {
            continue;
        }
        if *approved {
            collected.approved.push(ApprovedCall {
                approval_id: approval_id.clone(),
                tool_call: tool_call.clone(),
            });
        } else {
            collected.denied.push(DeniedCall {
                approval_id: approval_id.clone(),
                tool_call: tool_call.clone(),
                reason: reason.clone(),
            });
        }
    }
    collected
}
