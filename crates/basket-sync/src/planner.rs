//! How many days of history a run requests from the source.

use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBasis {
    /// Caller supplied the day count.
    Override,
    /// Days since the latest stored order.
    Incremental,
    /// Nothing stored yet.
    Initial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub days: i64,
    pub basis: WindowBasis,
}

impl WindowPlan {
    /// A non-positive window means there is nothing to fetch.
    pub fn is_up_to_date(&self) -> bool {
        self.days <= 0
    }

    pub fn describe(&self) -> String {
        let days = self.days;
        match self.basis {
            WindowBasis::Override => {
                format!("Manual override: Fetching orders for the last {days} days.")
            }
            WindowBasis::Incremental => {
                format!("Incremental update: Fetching orders for the last {days} days.")
            }
            WindowBasis::Initial => {
                format!("Initial import: Fetching orders for the last {days} days.")
            }
        }
    }
}

/// An override is used verbatim, even when non-positive.
pub fn plan_window(
    days_override: Option<i64>,
    latest_stored: Option<NaiveDate>,
    today: NaiveDate,
    default_days: i64,
) -> WindowPlan {
    match (days_override, latest_stored) {
        (Some(days), _) => WindowPlan {
            days,
            basis: WindowBasis::Override,
        },
        (None, Some(latest)) => WindowPlan {
            days: (today - latest).num_days(),
            basis: WindowBasis::Incremental,
        },
        (None, None) => WindowPlan {
            days: default_days,
            basis: WindowBasis::Initial,
        },
    }
}
