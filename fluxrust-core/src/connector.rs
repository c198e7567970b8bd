//! Graph edges: forward fan-out and backward fan-in over context ordering.
//!
//! A [`Connector`] wraps the buffer a node publishes and multiplexes it to
//! any number of independently scheduled consumers, then folds their
//! backward contributions into one accumulated gradient, all of it ordered
//! by `wait` edges between the contexts involved, never by locks around the
//! data itself.
//!
//! Per step the edge moves through `Idle → Published → Accumulating →
//! Ready → Idle`. Violations of that protocol are driver bugs, not data
//! conditions, and surface as [`FluxRustError::Protocol`].

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::FluxRustError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Published,
    Accumulating,
    Ready,
}

#[derive(Debug)]
struct StepState {
    phase: Phase,
    /// Contributions expected this step; set at `fprop` from the override
    /// or the registration count.
    expected: usize,
    received: usize,
    /// Number of registered backward consumers.
    registered: usize,
    /// Owner-set per-step expectation for truncated sequences.
    expected_override: Option<usize>,
}

/// A registered forward consumer. Same-device consumers read through a
/// clone of the value handle; cross-device consumers get a private copy
/// refreshed on every `fprop`.
#[derive(Debug)]
struct ForwardSlot {
    context: Context,
    private: Option<Buffer>,
}

/// A registered backward consumer's buffers.
#[derive(Debug)]
struct GradSlot {
    context: Context,
    /// Where the consumer writes its contribution, on its own device.
    contribution: Buffer,
    /// Staging copy on the accumulation device when the two differ.
    staged: Option<Buffer>,
}

#[derive(Debug)]
struct BackwardPath {
    context: Context,
    grad: Buffer,
    slots: Mutex<Vec<GradSlot>>,
}

#[derive(Debug)]
struct ConnectorInner {
    value: Buffer,
    fprop_context: Context,
    backward: Option<BackwardPath>,
    consumers: Mutex<Vec<ForwardSlot>>,
    state: Mutex<StepState>,
}

/// A graph edge carrying a value buffer plus fan-out/fan-in bookkeeping.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        f.debug_struct("Connector")
            .field("value", &self.inner.value)
            .field("requires_grad", &self.inner.backward.is_some())
            .field("phase", &st.phase)
            .field("received", &st.received)
            .field("expected", &st.expected)
            .finish()
    }
}

impl Connector {
    /// Wraps `value` as a non-differentiable edge produced on
    /// `fprop_context`.
    pub fn new(value: Buffer, fprop_context: Context) -> Connector {
        Connector {
            inner: Arc::new(ConnectorInner {
                value,
                fprop_context,
                backward: None,
                consumers: Mutex::new(Vec::new()),
                state: Mutex::new(StepState {
                    phase: Phase::Idle,
                    expected: 0,
                    received: 0,
                    registered: 0,
                    expected_override: None,
                }),
            }),
        }
    }

    /// Wraps `value` as a differentiable edge: backward contributions are
    /// accumulated on `bprop_context`, into a buffer sized like `value`.
    pub fn with_grad(
        value: Buffer,
        fprop_context: Context,
        bprop_context: Context,
    ) -> Result<Connector, FluxRustError> {
        let grad = value.empty_like_on(bprop_context.device())?;
        Ok(Connector {
            inner: Arc::new(ConnectorInner {
                value,
                fprop_context,
                backward: Some(BackwardPath {
                    context: bprop_context,
                    grad,
                    slots: Mutex::new(Vec::new()),
                }),
                consumers: Mutex::new(Vec::new()),
                state: Mutex::new(StepState {
                    phase: Phase::Idle,
                    expected: 0,
                    received: 0,
                    registered: 0,
                    expected_override: None,
                }),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, StepState> {
        self.inner.state.lock().expect("connector state poisoned")
    }

    // -- wiring -------------------------------------------------------------

    /// Registers a forward-only consumer scheduled on `ctx` and returns the
    /// handle it reads after each `fprop`.
    pub fn register_usage(&self, ctx: &Context) -> Result<Buffer, FluxRustError> {
        let handle = if ctx.device() == self.inner.value.device() {
            None
        } else {
            Some(self.inner.value.empty_like_on(ctx.device())?)
        };
        let mut consumers = self.inner.consumers.lock().expect("consumer list poisoned");
        let out = handle.clone().unwrap_or_else(|| self.inner.value.clone());
        trace!(
            "connector consumer registered on {:?} ({})",
            ctx.device(),
            if handle.is_some() { "private copy" } else { "shared view" }
        );
        consumers.push(ForwardSlot {
            context: ctx.clone(),
            private: handle,
        });
        Ok(out)
    }

    /// Registers a differentiable consumer: forward reads on `f_ctx`,
    /// backward contributions issued on `b_ctx`. Returns the forward handle
    /// and the [`GradSink`] the consumer pushes its gradient through.
    ///
    /// # Errors
    /// `Configuration` when the edge was built non-differentiable.
    pub fn register_usage_with_grad(
        &self,
        f_ctx: &Context,
        b_ctx: &Context,
    ) -> Result<(Buffer, GradSink), FluxRustError> {
        let backward = self.inner.backward.as_ref().ok_or_else(|| {
            FluxRustError::Configuration {
                message: "backward consumer registered on a non-differentiable connector"
                    .to_string(),
            }
        })?;
        let forward = self.register_usage(f_ctx)?;
        let contribution = self.inner.value.empty_like_on(b_ctx.device())?;
        let staged = if b_ctx.device() == backward.context.device() {
            None
        } else {
            Some(self.inner.value.empty_like_on(backward.context.device())?)
        };
        let slot = {
            let mut slots = backward.slots.lock().expect("grad slot list poisoned");
            slots.push(GradSlot {
                context: b_ctx.clone(),
                contribution,
                staged,
            });
            slots.len() - 1
        };
        self.state().registered += 1;
        Ok((
            forward,
            GradSink {
                connector: self.clone(),
                slot,
            },
        ))
    }

    /// Overrides the number of backward contributions expected on the next
    /// steps, for sequences where only a prefix of the registered
    /// consumers is active.
    ///
    /// # Errors
    /// `Configuration` when `n` exceeds the registered consumer count.
    pub fn set_expected_contributions(&self, n: usize) -> Result<(), FluxRustError> {
        let mut st = self.state();
        if n > st.registered {
            return Err(FluxRustError::Configuration {
                message: format!(
                    "expected {} backward contributions but only {} consumers are registered",
                    n, st.registered
                ),
            });
        }
        st.expected_override = Some(n);
        Ok(())
    }

    // -- step execution -----------------------------------------------------

    /// Publishes the current value: orders every consumer context after the
    /// producer, refreshes cross-device copies (at the value's current
    /// logical extents), and arms the backward accumulation for the step.
    ///
    /// The owning node calls this after enqueueing the compute that fills
    /// the value buffer.
    pub fn fprop(&self) -> Result<(), FluxRustError> {
        {
            let mut st = self.state();
            match st.phase {
                Phase::Idle => {}
                // A published edge nobody propagated back through rolls
                // straight into the next step (forward-only execution,
                // truncated sequences).
                Phase::Published if st.received == 0 => {}
                Phase::Published | Phase::Accumulating => {
                    return Err(FluxRustError::Protocol {
                        message: format!(
                            "fprop during backward accumulation ({}/{} contributions received)",
                            st.received, st.expected
                        ),
                    });
                }
                Phase::Ready => {
                    return Err(FluxRustError::Protocol {
                        message: "fprop with an unread accumulated gradient".to_string(),
                    });
                }
            }
            st.expected = st.expected_override.unwrap_or(st.registered);
            st.received = 0;
            st.phase = Phase::Published;
        }

        let (nrows, ncols) = self.inner.value.shape();
        let consumers = self.inner.consumers.lock().expect("consumer list poisoned");
        for slot in consumers.iter() {
            slot.context.wait([&self.inner.fprop_context]);
            if let Some(private) = &slot.private {
                private.set_extents(nrows, ncols)?;
                self.inner.value.copy_to(&slot.context, private)?;
            }
        }
        drop(consumers);

        if let Some(backward) = &self.inner.backward {
            backward.grad.set_extents(nrows, ncols)?;
            let slots = backward.slots.lock().expect("grad slot list poisoned");
            for slot in slots.iter() {
                slot.contribution.set_extents(nrows, ncols)?;
                if let Some(staged) = &slot.staged {
                    staged.set_extents(nrows, ncols)?;
                }
            }
        }
        Ok(())
    }

    /// Hands the accumulated gradient to the owning node and returns the
    /// edge to `Idle` for the next step.
    ///
    /// # Errors
    /// `Configuration` on a non-differentiable edge; `Protocol` before the
    /// step's contributions are complete.
    pub fn bprop(&self) -> Result<Buffer, FluxRustError> {
        let backward = self.inner.backward.as_ref().ok_or_else(|| {
            FluxRustError::Configuration {
                message: "bprop on a non-differentiable connector".to_string(),
            }
        })?;
        let mut st = self.state();
        match st.phase {
            Phase::Ready => {}
            Phase::Published | Phase::Accumulating => {
                return Err(FluxRustError::Protocol {
                    message: format!(
                        "bprop before accumulation completed ({}/{} contributions received)",
                        st.received, st.expected
                    ),
                });
            }
            Phase::Idle => {
                return Err(FluxRustError::Protocol {
                    message: "bprop before fprop".to_string(),
                });
            }
        }
        st.phase = Phase::Idle;
        drop(st);
        Ok(backward.grad.clone())
    }

    fn accept_contribution(&self, slot_index: usize) -> Result<(), FluxRustError> {
        let backward = self
            .inner
            .backward
            .as_ref()
            .expect("grad sink exists only on differentiable connectors");
        let slots = backward.slots.lock().expect("grad slot list poisoned");
        let slot = &slots[slot_index];

        let first = {
            let mut st = self.state();
            match st.phase {
                Phase::Published | Phase::Accumulating => {}
                Phase::Ready => {
                    return Err(FluxRustError::Protocol {
                        message: format!(
                            "backward contribution after the expected count ({}) was satisfied",
                            st.expected
                        ),
                    });
                }
                Phase::Idle => {
                    return Err(FluxRustError::Protocol {
                        message: "backward contribution outside an active step".to_string(),
                    });
                }
            }
            if st.received >= st.expected {
                return Err(FluxRustError::Protocol {
                    message: format!(
                        "backward contribution after the expected count ({}) was satisfied",
                        st.expected
                    ),
                });
            }
            st.received += 1;
            st.phase = if st.received == st.expected {
                Phase::Ready
            } else {
                Phase::Accumulating
            };
            st.received == 1
        };

        // The accumulation queue must observe everything the contributor
        // enqueued up to its commit.
        backward.context.wait([&slot.context]);
        let source = match &slot.staged {
            Some(staged) => {
                slot.contribution.copy_to(&backward.context, staged)?;
                staged
            }
            None => &slot.contribution,
        };
        if first {
            source.copy_to(&backward.context, &backward.grad)?;
        } else {
            backward.grad.add(&backward.context, source)?;
        }
        trace!("connector contribution {} accepted", slot_index);
        Ok(())
    }

    // -- accessors ----------------------------------------------------------

    /// The wrapped value buffer (handle clone).
    pub fn value(&self) -> Buffer {
        self.inner.value.clone()
    }

    /// True when the edge carries a backward path.
    pub fn requires_grad(&self) -> bool {
        self.inner.backward.is_some()
    }

    /// The accumulated-gradient buffer of a differentiable edge.
    pub fn grad(&self) -> Option<Buffer> {
        self.inner.backward.as_ref().map(|b| b.grad.clone())
    }

    /// The producing context.
    pub fn fprop_context(&self) -> Context {
        self.inner.fprop_context.clone()
    }

    /// The accumulation context of a differentiable edge.
    pub fn bprop_context(&self) -> Option<Context> {
        self.inner.backward.as_ref().map(|b| b.context.clone())
    }

    pub fn nrows(&self) -> usize {
        self.inner.value.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.inner.value.ncols()
    }

    /// Moves the value's logical row count for the coming step (bounded by
    /// the capacity fixed at construction).
    pub fn set_nrows(&self, nrows: usize) -> Result<(), FluxRustError> {
        self.inner.value.set_nrows(nrows)
    }

    /// Moves the value's logical column count for the coming step.
    pub fn set_ncols(&self, ncols: usize) -> Result<(), FluxRustError> {
        self.inner.value.set_ncols(ncols)
    }
}

/// The handle a differentiable consumer pushes its gradient through.
///
/// The consumer writes its contribution into [`GradSink::buffer`] on its
/// own backward context, then calls [`GradSink::commit`] exactly once per
/// step to fold it into the edge's accumulated gradient.
#[derive(Debug, Clone)]
pub struct GradSink {
    connector: Connector,
    slot: usize,
}

impl GradSink {
    /// The consumer-side contribution buffer.
    pub fn buffer(&self) -> Buffer {
        let backward = self
            .connector
            .inner
            .backward
            .as_ref()
            .expect("grad sink exists only on differentiable connectors");
        let slots = backward.slots.lock().expect("grad slot list poisoned");
        slots[self.slot].contribution.clone()
    }

    /// The context this consumer's backward work is ordered on.
    pub fn context(&self) -> Context {
        let backward = self
            .connector
            .inner
            .backward
            .as_ref()
            .expect("grad sink exists only on differentiable connectors");
        let slots = backward.slots.lock().expect("grad slot list poisoned");
        slots[self.slot].context.clone()
    }

    /// Folds this consumer's contribution into the accumulated gradient,
    /// ordering the accumulation context after the contributor.
    ///
    /// # Errors
    /// `Protocol` when called outside an active step or after the step's
    /// expected count is satisfied.
    pub fn commit(&self) -> Result<(), FluxRustError> {
        self.connector.accept_contribution(self.slot)
    }
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        debug!("connector dropped ({:?})", self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::types::DType;

    fn cpu() -> Context {
        Context::new(Device::Cpu).unwrap()
    }

    fn edge(differentiable: bool) -> Connector {
        let ctx = cpu();
        let value = Buffer::empty_on(Device::Cpu, 2, 3, DType::F32).unwrap();
        if differentiable {
            Connector::with_grad(value, ctx.clone(), ctx).unwrap()
        } else {
            Connector::new(value, ctx)
        }
    }

    #[test]
    fn grad_registration_on_plain_edge_is_invalid_wiring() {
        let conn = edge(false);
        let ctx = cpu();
        let err = conn.register_usage_with_grad(&ctx, &ctx).unwrap_err();
        assert!(matches!(err, FluxRustError::Configuration { .. }));
        assert!(matches!(
            conn.bprop().unwrap_err(),
            FluxRustError::Configuration { .. }
        ));
    }

    #[test]
    fn contribution_before_fprop_is_a_protocol_error() {
        let conn = edge(true);
        let ctx = cpu();
        let (_, sink) = conn.register_usage_with_grad(&ctx, &ctx).unwrap();
        assert!(matches!(
            sink.commit().unwrap_err(),
            FluxRustError::Protocol { .. }
        ));
    }

    #[test]
    fn extra_contribution_is_a_protocol_error() {
        let conn = edge(true);
        let ctx = cpu();
        let (_, sink) = conn.register_usage_with_grad(&ctx, &ctx).unwrap();
        conn.fprop().unwrap();
        sink.commit().unwrap();
        assert!(matches!(
            sink.commit().unwrap_err(),
            FluxRustError::Protocol { .. }
        ));
    }

    #[test]
    fn fprop_midway_through_accumulation_is_a_protocol_error() {
        let conn = edge(true);
        let ctx = cpu();
        let (_, sink_a) = conn.register_usage_with_grad(&ctx, &ctx).unwrap();
        let (_, _sink_b) = conn.register_usage_with_grad(&ctx, &ctx).unwrap();
        conn.fprop().unwrap();
        sink_a.commit().unwrap();
        assert!(matches!(
            conn.fprop().unwrap_err(),
            FluxRustError::Protocol { .. }
        ));
    }

    #[test]
    fn bprop_resets_the_step() {
        let conn = edge(true);
        let ctx = cpu();
        let (_, sink) = conn.register_usage_with_grad(&ctx, &ctx).unwrap();
        for _ in 0..3 {
            conn.fprop().unwrap();
            sink.buffer().fill(&ctx, 1.0f32).unwrap();
            sink.commit().unwrap();
            let _ = conn.bprop().unwrap();
        }
    }

    #[test]
    fn forward_only_edge_republishes_without_bprop() {
        let conn = edge(false);
        let ctx = cpu();
        let _reader = conn.register_usage(&ctx).unwrap();
        conn.fprop().unwrap();
        conn.fprop().unwrap(); // never left Published, no contributions pending
    }

    #[test]
    fn expected_contributions_cannot_exceed_registrations() {
        let conn = edge(true);
        let ctx = cpu();
        let _ = conn.register_usage_with_grad(&ctx, &ctx).unwrap();
        assert!(conn.set_expected_contributions(1).is_ok());
        assert!(matches!(
            conn.set_expected_contributions(2).unwrap_err(),
            FluxRustError::Configuration { .. }
        ));
    }
}
