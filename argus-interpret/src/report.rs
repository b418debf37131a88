//! Driver-facing reports: each terminal context rendered as a JSON document
//! (the constraint pool plus role indices) with its log trail and call
//! stack, the sole artifact the external solver consumes.

use argus_ir::Source;
use argus_sym::CtrSetDump;
use serde::Serialize;

use crate::context::{Context, ContextSet};
use crate::value::ShValue;

#[derive(Clone, Debug, Serialize)]
pub struct LogJson {
    pub level: &'static str,
    pub message: String,
    pub source: Source,
}

#[derive(Clone, Debug, Serialize)]
pub struct FrameJson {
    pub name: String,
    pub source: Source,
}

#[derive(Clone, Debug, Serialize)]
pub struct CtxReport {
    pub constraints: CtrSetDump,
    pub logs: Vec<LogJson>,
    pub call_stack: Vec<FrameJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

pub fn ctx_report<T: std::fmt::Display>(ctx: &Context<T>) -> CtxReport {
    CtxReport {
        constraints: ctx.ctr_set.dump(),
        logs: ctx
            .logs
            .iter()
            .map(|entry| LogJson {
                level: entry.level.label(),
                message: entry.message.to_string(),
                source: entry.source,
            })
            .collect(),
        call_stack: ctx
            .call_stack
            .iter()
            .map(|frame| FrameJson {
                name: frame.name.to_string(),
                source: frame.source,
            })
            .collect(),
        failure: ctx.failed.as_ref().map(|e| e.reason.to_string()),
        value: Some(ctx.ret_val.to_string()),
    }
}

/// The complete result of one analysis run: three disjoint context lists.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub success: Vec<CtxReport>,
    pub failed: Vec<CtxReport>,
    pub stopped: Vec<CtxReport>,
}

impl RunReport {
    pub fn from_set(set: &ContextSet<ShValue>) -> Self {
        RunReport {
            success: set.live().iter().map(ctx_report).collect(),
            failed: set.failed().iter().map(ctx_report).collect(),
            stopped: set.stopped().iter().map(ctx_report).collect(),
        }
    }
}
