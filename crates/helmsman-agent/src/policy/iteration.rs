//! Dynamic iteration policy.
//!
//! The iteration budget adapts once, up front, to the task description
//! length, clamped to [base_budget, max_iterations]. Longer goals get
//! more room; a one-liner does not get to loop a hundred times.

pub struct IterationPolicy {
    base_budget: usize,
    max_iterations: usize,
    available_time_seconds: f64,
    adapted_budget: Option<usize>,
}

impl IterationPolicy {
    /// Characters of task description per extra iteration granted.
    const CHARS_PER_EXTRA_ITERATION: usize = 50;

    pub fn new(base_budget: usize, max_iterations: usize, available_time_seconds: f64) -> Self {
        Self {
            base_budget,
            max_iterations,
            available_time_seconds,
            adapted_budget: None,
        }
    }

    /// Compute the adapted budget from the task description. Monotonic
    /// in input length, clamped to [base_budget, max_iterations].
    pub fn calculate_budget(&mut self, task_description: &str) -> usize {
        let extra = task_description.len() / Self::CHARS_PER_EXTRA_ITERATION;
        let budget = (self.base_budget + extra).clamp(self.base_budget, self.max_iterations);
        self.adapted_budget = Some(budget);
        budget
    }

    pub fn budget(&self) -> usize {
        self.adapted_budget.unwrap_or(self.base_budget)
    }

    /// Decide whether the loop may continue, with a human-readable stop
    /// reason when it may not.
    pub fn should_continue(
        &self,
        iteration: usize,
        has_fatal_error: bool,
        elapsed_seconds: f64,
    ) -> (bool, String) {
        if has_fatal_error {
            return (false, "fatal error observed".into());
        }
        if elapsed_seconds > self.available_time_seconds {
            return (
                false,
                format!(
                    "time budget exceeded ({:.0}s > {:.0}s)",
                    elapsed_seconds, self.available_time_seconds
                ),
            );
        }
        if iteration > self.max_iterations {
            return (
                false,
                format!("max iterations exceeded ({})", self.max_iterations),
            );
        }
        let budget = self.budget();
        if iteration > budget {
            return (false, format!("iteration budget exhausted ({})", budget));
        }
        (true, String::new())
    }
}
