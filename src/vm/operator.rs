//! Operator shapes: the three contracts the VM can drive.
//!
//! Instant operators complete in one call. Iterative method operators are
//! explicit state machines: `start` validates input and returns a run, the
//! VM then steps the run until `finished=true`. A run is single-threaded
//! with respect to itself; stepping past the end is a protocol violation
//! and is rejected with `OperatorTerminated`.

use std::sync::Arc;

use crate::error::{ErrorCode, OperatorError};
use crate::value::Value;
use crate::vm::component::Component;

/// One yielded result from an iterative run.
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub value: Value,
    pub finished: bool,
}

impl Step {
    pub fn partial(value: Value) -> Self {
        Self {
            value,
            finished: false,
        }
    }

    pub fn done(value: Value) -> Self {
        Self {
            value,
            finished: true,
        }
    }
}

/// Free function operator: one input value in, one value or error out.
pub trait InstantFunction: Send + Sync {
    fn run(&self, input: Value) -> Result<Value, OperatorError>;
}

impl<F> InstantFunction for F
where
    F: Fn(Value) -> Result<Value, OperatorError> + Send + Sync,
{
    fn run(&self, input: Value) -> Result<Value, OperatorError> {
        self(input)
    }
}

/// Method operator bound to a component at invocation time.
pub trait InstantMethod: Send + Sync {
    fn run(&self, component: &Component, input: Value) -> Result<Value, OperatorError>;
}

impl<F> InstantMethod for F
where
    F: Fn(&Component, Value) -> Result<Value, OperatorError> + Send + Sync,
{
    fn run(&self, component: &Component, input: Value) -> Result<Value, OperatorError> {
        self(component, input)
    }
}

/// A live iterative invocation. Owns all streaming state for one call.
pub trait MethodRun: Send {
    fn step(&mut self) -> Result<Step, OperatorError>;
}

/// Factory side of an iterative method: `start` is the initialize phase.
pub trait IterativeMethod: Send + Sync {
    fn start(
        &self,
        component: &Component,
        input: Value,
    ) -> Result<Box<dyn MethodRun>, OperatorError>;
}

/// A component method in either shape.
#[derive(Clone)]
pub enum Method {
    Instant(Arc<dyn InstantMethod>),
    Iterative(Arc<dyn IterativeMethod>),
}

impl Method {
    pub fn instant<F>(f: F) -> Self
    where
        F: Fn(&Component, Value) -> Result<Value, OperatorError> + Send + Sync + 'static,
    {
        Method::Instant(Arc::new(f))
    }

    pub fn iterative(op: impl IterativeMethod + 'static) -> Self {
        Method::Iterative(Arc::new(op))
    }
}

/// Termination guard around a [`MethodRun`]: enforces that `finished=true`
/// is terminal.
pub struct ActiveRun {
    run: Box<dyn MethodRun>,
    finished: bool,
}

impl ActiveRun {
    pub fn new(run: Box<dyn MethodRun>) -> Self {
        Self {
            run,
            finished: false,
        }
    }

    pub fn step(&mut self) -> Result<Step, OperatorError> {
        if self.finished {
            return Err(OperatorError::code(ErrorCode::OperatorTerminated));
        }
        let step = self.run.step()?;
        if step.finished {
            self.finished = true;
        }
        Ok(step)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    impl MethodRun for Countdown {
        fn step(&mut self) -> Result<Step, OperatorError> {
            self.0 -= 1;
            let value = Value::Uint(self.0 as u64);
            if self.0 == 0 {
                Ok(Step::done(value))
            } else {
                Ok(Step::partial(value))
            }
        }
    }

    #[test]
    fn active_run_rejects_step_after_finish() {
        let mut run = ActiveRun::new(Box::new(Countdown(2)));
        assert!(!run.step().expect("first").finished);
        assert!(run.step().expect("second").finished);
        assert!(run.is_finished());
        let err = run.step().expect_err("terminated");
        assert_eq!(err.code, ErrorCode::OperatorTerminated);
    }

    #[test]
    fn closures_are_instant_operators() {
        let double = |input: Value| -> Result<Value, OperatorError> {
            let n = input
                .as_u64()
                .ok_or_else(|| OperatorError::new(ErrorCode::TypeError, "expected uint"))?;
            Ok(Value::Uint(n * 2))
        };
        assert_eq!(double.run(Value::Uint(4)).expect("ok"), Value::Uint(8));
    }
}
