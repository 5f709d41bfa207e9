//! Tuition bookkeeping: what a student owes, what was paid, which months are
//! still missing. Everything here is pure; the payment handlers load rows and
//! hand them over.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{Payment, PaymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TuitionTerms {
    pub months: i32,
    pub monthly_fee: i64,
}

impl TuitionTerms {
    pub fn total_due(&self) -> i64 {
        self.monthly_fee * i64::from(self.months)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total_months: i32,
    pub validated_payments: usize,
    pub pending_payments: usize,
    pub rejected_payments: usize,
    pub unrequested_months: i32,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub amount_remaining: i64,
    pub missing_months: Vec<i32>,
}

/// `{1..=months}` minus the months that hold a validated payment.
pub fn missing_months<I>(months: i32, validated: I) -> Vec<i32>
where
    I: IntoIterator<Item = i32>,
{
    let paid: BTreeSet<i32> = validated.into_iter().collect();
    (1..=months).filter(|month| !paid.contains(month)).collect()
}

fn validated_months(payments: &[Payment]) -> impl Iterator<Item = i32> + '_ {
    payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Validated)
        .map(|p| p.month)
}

pub fn summarize(terms: TuitionTerms, payments: &[Payment]) -> LedgerSummary {
    let count = |status: PaymentStatus| payments.iter().filter(|p| p.status == status).count();
    let amount_paid: i64 = payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Validated)
        .map(|p| p.amount)
        .sum();
    let requested = payments.iter().map(|p| p.month).collect::<BTreeSet<_>>().len() as i32;
    let amount_due = terms.total_due();

    LedgerSummary {
        total_months: terms.months,
        validated_payments: count(PaymentStatus::Validated),
        pending_payments: count(PaymentStatus::Pending),
        rejected_payments: count(PaymentStatus::Rejected),
        unrequested_months: (terms.months - requested).max(0),
        amount_due,
        amount_paid,
        amount_remaining: amount_due - amount_paid,
        missing_months: missing_months(terms.months, validated_months(payments)),
    }
}

/// How a month request lands in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthRequest {
    Create,
    /// The month was rejected earlier; the same row goes back to pending.
    Reopen(Uuid),
}

pub fn check_month_request(
    terms: TuitionTerms,
    existing: &[Payment],
    month: i32,
    amount: i64,
) -> Result<MonthRequest, Error> {
    if month < 1 || month > terms.months {
        return Err(Error::invalid(format!(
            "Month must be between 1 and {}",
            terms.months
        )));
    }
    if amount <= 0 {
        return Err(Error::invalid("Amount must be positive"));
    }

    match existing.iter().find(|p| p.month == month) {
        None => Ok(MonthRequest::Create),
        Some(p) => match p.status {
            PaymentStatus::Validated => Err(Error::conflict(format!(
                "Month {} is already paid",
                month
            ))),
            PaymentStatus::Pending => Err(Error::conflict(format!(
                "Month {} is already awaiting validation",
                month
            ))),
            PaymentStatus::Rejected => Ok(MonthRequest::Reopen(p.id)),
        },
    }
}

pub fn check_validation(payment: &Payment) -> Result<(), Error> {
    if payment.status == PaymentStatus::Validated {
        return Err(Error::conflict("This payment is already validated"));
    }
    Ok(())
}

pub fn check_rejection(payment: &Payment) -> Result<(), Error> {
    match payment.status {
        PaymentStatus::Validated => Err(Error::conflict(
            "A validated payment cannot be rejected",
        )),
        PaymentStatus::Rejected => Err(Error::conflict("This payment is already rejected")),
        PaymentStatus::Pending => Ok(()),
    }
}

pub fn payment_rate(paid: i64, expected: i64) -> String {
    if expected <= 0 {
        return "0%".to_string();
    }
    format!("{:.2}%", paid as f64 / expected as f64 * 100.0)
}

/// One validated student as seen by the statistics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StudentLedger {
    pub enrollment_id: Uuid,
    pub name: String,
    pub email: String,
    pub formation: String,
    pub months: i32,
    pub monthly_fee: i64,
    pub validated_months: Vec<i32>,
    pub revenue: i64,
}

impl StudentLedger {
    fn paid_months(&self) -> i64 {
        self.validated_months
            .iter()
            .filter(|m| (1..=self.months).contains(*m))
            .collect::<BTreeSet<_>>()
            .len() as i64
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Coverage {
    Overall {
        expected_months: i64,
        paid_months: i64,
        unpaid_months: i64,
        payment_rate: String,
    },
    Month {
        month: i32,
        students_owing: i64,
        students_paid: i64,
        students_unpaid: i64,
        payment_rate: String,
    },
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct FormationBreakdown {
    pub formation: String,
    pub students: usize,
    pub revenue: i64,
    #[serde(flatten)]
    pub coverage: Coverage,
    pub roster: Option<Vec<StudentLedger>>,
}

/// Groups students per formation (alphabetical). With `month`, coverage is
/// computed for that single month among students whose plan includes it.
pub fn formation_breakdown(
    students: Vec<StudentLedger>,
    month: Option<i32>,
    with_roster: bool,
) -> Vec<FormationBreakdown> {
    let mut grouped: BTreeMap<String, Vec<StudentLedger>> = BTreeMap::new();
    for student in students {
        grouped
            .entry(student.formation.clone())
            .or_default()
            .push(student);
    }

    grouped
        .into_iter()
        .map(|(formation, students)| {
            let revenue = students.iter().map(|s| s.revenue).sum();
            let coverage = match month {
                Some(month) => {
                    let owing: Vec<&StudentLedger> =
                        students.iter().filter(|s| s.months >= month).collect();
                    let paid = owing
                        .iter()
                        .filter(|s| s.validated_months.contains(&month))
                        .count() as i64;
                    let owing = owing.len() as i64;
                    Coverage::Month {
                        month,
                        students_owing: owing,
                        students_paid: paid,
                        students_unpaid: owing - paid,
                        payment_rate: payment_rate(paid, owing),
                    }
                }
                None => {
                    let expected: i64 = students.iter().map(|s| i64::from(s.months)).sum();
                    let paid: i64 = students.iter().map(StudentLedger::paid_months).sum();
                    Coverage::Overall {
                        expected_months: expected,
                        paid_months: paid,
                        unpaid_months: expected - paid,
                        payment_rate: payment_rate(paid, expected),
                    }
                }
            };
            FormationBreakdown {
                formation,
                students: students.len(),
                revenue,
                coverage,
                roster: if with_roster { Some(students) } else { None },
            }
        })
        .collect()
}
