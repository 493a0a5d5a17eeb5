//! Dispatcher and policy interpreter
//!
//! Protocol state machines drive requests through processing sections with
//! [`Dispatcher::push`] and [`Dispatcher::resume`] (or [`Dispatcher::call`]
//! for both at once). Pushing never runs policy: it either places a frame on
//! the request's stack or, when the server has no policy for the section,
//! reports the section's default result straight away.
//!
//! Resuming interprets frames until the top frame completes. Each result a
//! node produces is folded into the current frame through the section's
//! default-action table:
//!
//! - `Return` stops the frame and hands the code to the parent
//! - `Reject` stops the frame with `reject`
//! - `Priority(n)` keeps the code if `n` is at least the current priority

use crate::compile::CompiledSection;
use crate::error::DispatchError;
use crate::lifecycle::{VirtualServer, VirtualServers};
use crate::policy::Node;
use crate::request::{Frame, Request, MAX_REQUEST_DEPTH};
use crate::section::SectionRef;
use aaa_proto::{ModAction, RCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of [`Dispatcher::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// A frame was pushed; resume the request to run it
    PushedChild,
    /// No policy configured; the section's default result
    Done(RCode),
}

/// Runs requests against the servers of one image
#[derive(Clone, Copy)]
pub struct Dispatcher<'a> {
    servers: &'a VirtualServers,
}

impl<'a> Dispatcher<'a> {
    pub fn new(servers: &'a VirtualServers) -> Self {
        Dispatcher { servers }
    }

    pub fn servers(&self) -> &'a VirtualServers {
        self.servers
    }

    /// Prepare a section for execution
    ///
    /// Does not block and does not run any policy.
    pub fn push(
        &self,
        request: &mut Request,
        server: &VirtualServer,
        entry: &SectionRef,
        top_frame: bool,
    ) -> PushResult {
        match server.compiled_section(entry) {
            Some(section) => {
                let root = section.graph.root();
                request.stack.push(Frame::new(section, root, top_frame));
                PushResult::PushedChild
            }
            None => match server.default_rcode(entry) {
                Some(rcode) => {
                    debug!(
                        request = request.id,
                        server = %server.name(),
                        section = %server.section_name(entry),
                        rcode = %rcode,
                        "No policy configured, using default result"
                    );
                    PushResult::Done(rcode)
                }
                None => {
                    warn!(server = %server.name(), section = entry.id.index(), "Unknown section handle");
                    PushResult::Done(request.fail("unknown processing section"))
                }
            },
        }
    }

    /// Run pushed frames until the top frame completes
    pub async fn resume(&self, request: &mut Request) -> RCode {
        if request.stack.is_empty() {
            warn!(request = request.id, "Nothing to resume");
            return request.fail("nothing to resume");
        }

        loop {
            let (section, child) = {
                let Some(frame) = request.stack.last_mut() else {
                    return request.fail("execution stack underflow");
                };
                let section = frame.section.clone();
                let child = match section.graph.node(frame.node) {
                    Node::Group { children } => children.get(frame.next).copied(),
                    _ => None,
                };
                frame.next += 1;
                (section, child)
            };

            let Some(child) = child else {
                if let Some(done) = unwind(request) {
                    request.rcode = Some(done);
                    return done;
                }
                continue;
            };

            let rcode = match section.graph.node(child) {
                Node::Group { .. } => {
                    request.stack.push(Frame::new(section.clone(), child, false));
                    continue;
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    let current: &Request = request;
                    let chosen = branches
                        .iter()
                        .find(|(condition, _)| condition.eval(current))
                        .map(|(_, branch)| *branch)
                        .or(*otherwise);
                    if let Some(branch) = chosen {
                        request.stack.push(Frame::new(section.clone(), branch, false));
                    }
                    continue;
                }
                Node::Literal(rcode) => *rcode,
                Node::Module(call) => call.instance.call(&call.method, request).await,
                Node::Assign(assignment) => assignment.apply(request),
                Node::Call { server, .. } => self.sub_request(request, server).await,
            };

            let finished = match request.stack.last_mut() {
                Some(frame) => apply(frame, rcode),
                None => return request.fail("execution stack underflow"),
            };
            if finished {
                if let Some(done) = unwind(request) {
                    request.rcode = Some(done);
                    return done;
                }
            }
        }
    }

    /// Push a section as a top frame and run it to completion
    pub async fn call(&self, request: &mut Request, server: &VirtualServer, entry: &SectionRef) -> RCode {
        let rcode = match self.push(request, server, entry, true) {
            PushResult::PushedChild => self.resume(request).await,
            PushResult::Done(rcode) => rcode,
        };
        request.rcode = Some(rcode);
        self.servers
            .stats()
            .record(server.name(), &server.section_name(entry), rcode);
        rcode
    }

    /// Hand a request to the protocol entry point of its virtual server
    pub fn process<'r>(&'r self, request: &'r mut Request) -> BoxFuture<'r, Result<RCode, DispatchError>> {
        Box::pin(async move {
            let server = self
                .servers
                .server(&request.server)
                .ok_or_else(|| DispatchError::UnknownServer(request.server.clone()))?;
            let instance = server.instance().ok_or_else(|| DispatchError::Protocol {
                server: server.name().to_string(),
                reason: "virtual server not instantiated".to_string(),
            })?;
            let rcode = instance.process(self, server, request).await?;
            request.rcode = Some(rcode);
            Ok(rcode)
        })
    }

    async fn sub_request(&self, request: &mut Request, server: &str) -> RCode {
        if request.depth() >= MAX_REQUEST_DEPTH {
            return request.fail(format!("call {}: maximum nesting depth reached", server));
        }

        let mut child = request.sub_request(server);
        match self.process(&mut child).await {
            Ok(rcode) => {
                request.reply = child.reply;
                request.control = child.control;
                rcode
            }
            Err(e) => {
                warn!(request = request.id, server = %server, "Sub-request failed: {}", e);
                request.fail(e.to_string())
            }
        }
    }
}

/// Fold a result into a frame; true if the frame is finished
fn apply(frame: &mut Frame, rcode: RCode) -> bool {
    match frame.section.actions.action(rcode) {
        ModAction::Return => {
            frame.result = Some(rcode);
            true
        }
        ModAction::Reject => {
            frame.result = Some(RCode::Reject);
            true
        }
        ModAction::Priority(priority) => {
            if frame.result.is_none() || priority >= frame.priority {
                frame.result = Some(rcode);
                frame.priority = priority;
            }
            false
        }
    }
}

/// Pop finished frames
///
/// Returns the section result once a top frame (or the last frame) is
/// popped, and `None` while a parent frame still has work to do.
fn unwind(request: &mut Request) -> Option<RCode> {
    while let Some(frame) = request.stack.pop() {
        if frame.top_frame || request.stack.is_empty() {
            return Some(final_rcode(&frame.section, frame.result));
        }
        let result = frame.result?;
        let parent = request.stack.last_mut()?;
        if !apply(parent, result) {
            return None;
        }
    }
    None
}

fn final_rcode(section: &Arc<CompiledSection>, result: Option<RCode>) -> RCode {
    result.unwrap_or_else(|| section.default_rcode())
}
