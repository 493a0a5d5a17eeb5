//! Requests and their execution stack

use crate::compile::CompiledSection;
use crate::policy::NodeId;
use aaa_proto::{ListRef, PairList, RCode};
use std::sync::Arc;

/// Sub-requests nested deeper than this fail instead of recursing
pub const MAX_REQUEST_DEPTH: usize = 8;

/// One level of the execution stack
///
/// A frame runs the children of one group node of a compiled section. The
/// frame keeps the section alive through its `Arc`, so swapping or freeing
/// the server image never invalidates a running request.
#[derive(Debug, Clone)]
pub struct Frame {
    pub(crate) section: Arc<CompiledSection>,
    pub(crate) node: NodeId,
    pub(crate) next: usize,
    pub(crate) result: Option<RCode>,
    pub(crate) priority: u8,
    pub(crate) top_frame: bool,
}

impl Frame {
    pub(crate) fn new(section: Arc<CompiledSection>, node: NodeId, top_frame: bool) -> Self {
        Frame {
            section,
            node,
            next: 0,
            result: None,
            priority: 0,
            top_frame,
        }
    }

    /// Section this frame executes
    pub fn section(&self) -> &Arc<CompiledSection> {
        &self.section
    }

    /// Whether popping this frame completes a dispatch
    pub fn is_top_frame(&self) -> bool {
        self.top_frame
    }
}

/// A request being processed by a virtual server
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub id: u64,
    /// Name of the virtual server processing the request
    pub server: String,
    pub request: PairList,
    pub reply: PairList,
    pub control: PairList,
    /// Scratch attributes owned by the protocol state machine
    pub state: PairList,
    /// Result of the last completed section
    pub rcode: Option<RCode>,
    pub(crate) stack: Vec<Frame>,
    pub(crate) depth: usize,
}

impl Request {
    pub fn new(id: u64, server: impl Into<String>) -> Self {
        Request {
            id,
            server: server.into(),
            ..Default::default()
        }
    }

    /// Same request with these request attributes
    pub fn with_pairs(mut self, pairs: PairList) -> Self {
        self.request = pairs;
        self
    }

    /// Child request for `call <server>`, sharing copies of the attribute lists
    pub fn sub_request(&self, server: &str) -> Request {
        Request {
            id: self.id,
            server: server.to_string(),
            request: self.request.clone(),
            reply: self.reply.clone(),
            control: self.control.clone(),
            state: PairList::new(),
            rcode: None,
            stack: Vec::new(),
            depth: self.depth + 1,
        }
    }

    pub fn list(&self, list: ListRef) -> &PairList {
        match list {
            ListRef::Request => &self.request,
            ListRef::Reply => &self.reply,
            ListRef::Control => &self.control,
        }
    }

    pub fn list_mut(&mut self, list: ListRef) -> &mut PairList {
        match list {
            ListRef::Request => &mut self.request,
            ListRef::Reply => &mut self.reply,
            ListRef::Control => &mut self.control,
        }
    }

    /// Number of frames on the execution stack
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.stack
    }

    /// Sub-request nesting level
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Drop every pending frame
    ///
    /// Only the request's references to compiled sections go away; the
    /// sections themselves stay with the server image.
    pub fn cancel(&mut self) {
        self.stack.clear();
        self.rcode = None;
    }

    /// Record why a module or the dispatcher failed the request
    pub fn fail(&mut self, message: impl Into<String>) -> RCode {
        self.control.add("Module-Failure-Message", message.into());
        RCode::Fail
    }
}
