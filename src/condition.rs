//! The plugin contract: conditions that can request sleep to be inhibited.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Duration;
use slog::{info, Logger};
use thiserror::Error;

/// A condition that keeps the host awake while it holds.
///
/// The client calls `does_inhibit` once per `period`. Returning `true`
/// guarantees sleep is inhibited for the following period; returning `false`
/// means *this* condition needs no inhibition, though others may.
///
/// Conditions are checked sequentially on the client's event loop, so
/// `does_inhibit` must complete on the order of milliseconds. The period is
/// queried at registration and treated as fixed afterwards.
pub trait InhibitingCondition {
    /// Name used for logging and duplicate detection.
    fn name(&self) -> &str;

    /// Duration between checks, and the span a `true` answer inhibits for.
    /// Always positive.
    fn period(&self) -> Duration;

    fn does_inhibit(&mut self) -> bool;
}

#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("inhibiting condition {0:?} has already been registered")]
    Duplicate(String),
}

/// Collects the inhibiting conditions the client will run.
///
/// Populated from the built-in plugin list at startup; each plugin's
/// `register` function constructs conditions from its config section and
/// passes them to [`Registrar::accept`].
pub struct Registrar {
    logger: Logger,
    conditions: Vec<Rc<RefCell<dyn InhibitingCondition>>>,
}

impl Registrar {
    pub fn new(logger: &Logger) -> Registrar {
        Registrar {
            logger: logger.clone(),
            conditions: Vec::new(),
        }
    }

    /// Adds a condition, rejecting duplicates by name.
    pub fn accept(
        &mut self,
        condition: Rc<RefCell<dyn InhibitingCondition>>,
    ) -> Result<(), RegistrarError> {
        let name = condition.borrow().name().to_string();
        if self.contains(&name) {
            return Err(RegistrarError::Duplicate(name));
        }
        info!(&self.logger, "Registered inhibiting condition"; "condition" => &name);
        self.conditions.push(condition);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.conditions
            .iter()
            .any(|condition| condition.borrow().name() == name)
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn into_conditions(self) -> Vec<Rc<RefCell<dyn InhibitingCondition>>> {
        self.conditions
    }
}
