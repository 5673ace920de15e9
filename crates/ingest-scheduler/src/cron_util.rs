//! Cron-expression helpers shared by the affiliate, adapter-cycle, and
//! snapshot ticks.

use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Next occurrence of `cron_expr` strictly after `after`, or `None` on a
/// parse failure or an expression with no future occurrence. Callers on
/// a parse failure should log a warning and leave `nextRunAt` null,
/// parking the entity until an operator corrects the expression.
pub fn next_occurrence(cron_expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron::Schedule::from_str(cron_expr).ok()?.after(&after).next()
}
