use oke_gateway_controller_k8s_api::{Condition, Time};

pub const TRUE: &str = "True";
pub const FALSE: &str = "False";

/// The desired state of a single condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCondition {
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub observed_generation: Option<i64>,
}

// === impl NewCondition ===

impl NewCondition {
    pub fn new(
        type_: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    fn status_str(&self) -> &'static str {
        if self.status {
            TRUE
        } else {
            FALSE
        }
    }

    fn matches(&self, c: &Condition) -> bool {
        c.status == self.status_str()
            && c.reason == self.reason
            && c.message == self.message
            && c.observed_generation == self.observed_generation
    }
}

pub fn find<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Returns true if the condition is `True` and, when a generation is given,
/// was observed at that generation.
pub fn is_true(conditions: &[Condition], type_: &str, generation: Option<i64>) -> bool {
    find(conditions, type_).map_or(false, |c| {
        c.status == TRUE && (generation.is_none() || c.observed_generation == generation)
    })
}

/// Sets a condition, returning false if it was already in the desired state.
///
/// The transition time only moves when the status changes.
pub fn set(conditions: &mut Vec<Condition>, new: NewCondition, now: &Time) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) if new.matches(existing) => false,
        Some(existing) => {
            if existing.status != new.status_str() {
                existing.last_transition_time = now.clone();
            }
            existing.status = new.status_str().to_string();
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
            true
        }
        None => {
            conditions.push(Condition {
                type_: new.type_.clone(),
                status: new.status_str().to_string(),
                reason: new.reason,
                message: new.message,
                observed_generation: new.observed_generation,
                last_transition_time: now.clone(),
            });
            true
        }
    }
}

/// Sets every condition, returning true if any changed.
pub fn set_all(
    conditions: &mut Vec<Condition>,
    new: impl IntoIterator<Item = NewCondition>,
    now: &Time,
) -> bool {
    new.into_iter()
        .fold(false, |changed, c| set(conditions, c, now) || changed)
}

pub fn now() -> Time {
    Time(chrono::Utc::now())
}
