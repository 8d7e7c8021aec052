//! In-process simulated fiscal registrar for demos and CI.
//!
//! [`SimRegistrar`] builds an [`OperationRegistry`] whose handlers mutate a
//! shared [`SimState`] the way a real cash register would: a connection must
//! be open, receipts need an open shift, a receipt can only be closed once it
//! is fully paid, and every printing operation fails when the paper runs out.
//! Refusals use the vendor's numeric error codes so clients see the same
//! `error_code` values they would get from hardware.
//!
//! # Example
//!
//! ```rust
//! use fiscal_bridge::OperationExecutor;
//! use fiscal_hal::sim::SimRegistrar;
//! use fiscal_types::Arguments;
//!
//! let registrar = SimRegistrar::new().connected();
//! let registry = registrar.build();
//!
//! let out = registry.execute("ping", &Arguments::new()).unwrap();
//! assert_eq!(out.data.unwrap()["pong"], true);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use fiscal_bridge::executor::{optional_i64, optional_str, required_f64, required_str};
use fiscal_bridge::{ExecutionError, ExecutionOutput};
use fiscal_types::Arguments;
use serde_json::json;
use tracing::info;

use crate::registry::OperationRegistry;

// ────────────────────────────────────────────────────────────────────────────
// Device error codes
// ────────────────────────────────────────────────────────────────────────────

pub const CONNECTION_DISABLED: i64 = 1;
pub const NO_PAPER: i64 = 44;
pub const NOT_FULLY_PAID: i64 = 66;
pub const DENIED_IN_CLOSED_SHIFT: i64 = 73;
pub const NO_CASH: i64 = 80;
pub const DENIED_IN_CLOSED_RECEIPT: i64 = 81;
pub const DENIED_IN_OPENED_RECEIPT: i64 = 82;
pub const DENIED_IN_OPENED_SHIFT: i64 = 83;

const FISCAL_STORAGE_NUMBER: &str = "9999078900012345";
// Payment type 0 is cash; everything else is electronic.
const PAYMENT_CASH: i64 = 0;
const MONEY_EPSILON: f64 = 0.005;

// ────────────────────────────────────────────────────────────────────────────
// State
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OpenShift {
    pub number: u32,
    pub cashier: String,
    pub receipts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptItem {
    pub name: String,
    pub price: f64,
    pub quantity: f64,
    pub tax_type: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenReceipt {
    pub receipt_type: i64,
    pub items: Vec<ReceiptItem>,
    pub paid: f64,
    pub paid_cash: f64,
}

impl OpenReceipt {
    pub fn total(&self) -> f64 {
        self.items.iter().map(|i| i.price * i.quantity).sum()
    }
}

/// Everything the simulated register remembers.
#[derive(Debug, Clone, PartialEq)]
pub struct SimState {
    pub connected: bool,
    pub paper: bool,
    pub shift: Option<OpenShift>,
    pub last_shift_number: u32,
    pub receipt: Option<OpenReceipt>,
    pub cash_balance: f64,
    pub fiscal_document_number: u64,
    pub printed_lines: Vec<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            connected: false,
            paper: true,
            shift: None,
            last_shift_number: 0,
            receipt: None,
            cash_balance: 0.0,
            fiscal_document_number: 0,
            printed_lines: Vec::new(),
        }
    }
}

/// Shared handle to a running simulator's state.
#[derive(Debug, Clone, Default)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn snapshot(&self) -> SimState {
        self.lock().clone()
    }

    /// Load or remove the paper roll.
    pub fn set_paper(&self, present: bool) {
        self.lock().paper = present;
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for a simulated register.
#[derive(Debug, Default)]
pub struct SimRegistrar {
    handle: SimHandle,
}

type Operation = fn(&mut SimState, &Arguments) -> Result<ExecutionOutput, ExecutionError>;

const OPERATIONS: &[(&str, Operation)] = &[
    ("ping", SimState::ping),
    ("connection_open", SimState::connection_open),
    ("connection_close", SimState::connection_close),
    ("connection_is_opened", SimState::connection_is_opened),
    ("shift_open", SimState::shift_open),
    ("shift_close", SimState::shift_close),
    ("shift_get_status", SimState::shift_get_status),
    ("shift_print_x_report", SimState::shift_print_x_report),
    ("receipt_open", SimState::receipt_open),
    ("receipt_add_item", SimState::receipt_add_item),
    ("receipt_add_payment", SimState::receipt_add_payment),
    ("receipt_close", SimState::receipt_close),
    ("receipt_cancel", SimState::receipt_cancel),
    ("cash_in", SimState::cash_in),
    ("cash_out", SimState::cash_out),
    ("cash_drawer_open", SimState::cash_drawer_open),
    ("print_text", SimState::print_text),
    ("print_barcode", SimState::print_barcode),
];

impl SimRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the connection already open.
    pub fn connected(self) -> Self {
        self.handle.lock().connected = true;
        self
    }

    pub fn with_paper(self, present: bool) -> Self {
        self.handle.set_paper(present);
        self
    }

    pub fn with_cash(self, balance: f64) -> Self {
        self.handle.lock().cash_balance = balance;
        self
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    /// Build the operation table.  Every handler shares this registrar's state.
    pub fn build(&self) -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        for &(name, operation) in OPERATIONS {
            let handle = self.handle.clone();
            registry.register(name, move |arguments| operation(&mut handle.lock(), arguments));
        }
        info!(operations = registry.len(), "simulated registrar ready");
        registry
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Operations
// ────────────────────────────────────────────────────────────────────────────

impl SimState {
    fn ping(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        Ok(ExecutionOutput::data(json!({"pong": true})))
    }

    fn connection_open(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.connected = true;
        Ok(ExecutionOutput::message("connection established"))
    }

    fn connection_close(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.connected = false;
        Ok(ExecutionOutput::message("connection closed"))
    }

    fn connection_is_opened(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        let message = if self.connected {
            "connection is active"
        } else {
            "connection is not established"
        };
        Ok(ExecutionOutput::data(json!({"is_opened": self.connected})).with_message(message))
    }

    fn shift_open(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let cashier = required_str(arguments, "cashier_name")?;
        if self.shift.is_some() {
            return Err(ExecutionError::device(DENIED_IN_OPENED_SHIFT, "denied in opened shift"));
        }
        self.require_paper()?;

        self.last_shift_number += 1;
        self.next_document();
        self.shift = Some(OpenShift {
            number: self.last_shift_number,
            cashier: cashier.to_string(),
            receipts: 0,
        });
        Ok(
            ExecutionOutput::data(json!({"shift_number": self.last_shift_number}))
                .with_message(format!("shift #{} opened", self.last_shift_number)),
        )
    }

    fn shift_close(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        required_str(arguments, "cashier_name")?;
        let number = self.require_shift()?.number;
        self.require_no_receipt()?;
        self.require_paper()?;

        let document = self.next_document();
        self.shift = None;
        Ok(ExecutionOutput::data(json!({
            "shift_number": number,
            "fiscal_document_number": document,
            "fiscal_document_sign": document_sign(document),
            "fiscal_storage_number": FISCAL_STORAGE_NUMBER,
        }))
        .with_message("shift closed, Z-report printed"))
    }

    fn shift_get_status(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let data = match &self.shift {
            Some(shift) => json!({
                "shift_opened": true,
                "shift_number": shift.number,
                "shift_expired": false,
                "receipts_count": shift.receipts,
            }),
            None => json!({
                "shift_opened": false,
                "shift_number": self.last_shift_number,
                "shift_expired": false,
                "receipts_count": null,
            }),
        };
        Ok(ExecutionOutput::data(data))
    }

    fn shift_print_x_report(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        required_str(arguments, "cashier_name")?;
        self.require_paper()?;
        self.print("X-REPORT");
        Ok(ExecutionOutput::message("X-report printed"))
    }

    fn receipt_open(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let receipt_type = optional_i64(arguments, "receipt_type")?
            .ok_or_else(|| ExecutionError::MissingArgument("receipt_type".to_string()))?;
        required_str(arguments, "cashier_name")?;
        optional_str(arguments, "customer_contact")?;
        self.require_shift()?;
        self.require_no_receipt()?;
        self.require_paper()?;

        self.receipt = Some(OpenReceipt {
            receipt_type,
            items: Vec::new(),
            paid: 0.0,
            paid_cash: 0.0,
        });
        Ok(ExecutionOutput::message(format!("receipt of type {receipt_type} opened")))
    }

    fn receipt_add_item(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let name = required_str(arguments, "name")?;
        let price = required_f64(arguments, "price")?;
        let quantity = required_f64(arguments, "quantity")?;
        let tax_type = optional_i64(arguments, "tax_type")?
            .ok_or_else(|| ExecutionError::MissingArgument("tax_type".to_string()))?;
        if price < 0.0 {
            return Err(invalid("price", "must not be negative"));
        }
        if quantity <= 0.0 {
            return Err(invalid("quantity", "must be positive"));
        }

        let receipt = self.require_receipt()?;
        receipt.items.push(ReceiptItem {
            name: name.to_string(),
            price,
            quantity,
            tax_type,
        });
        Ok(ExecutionOutput::message(format!("item '{name}' added")))
    }

    fn receipt_add_payment(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let payment_type = optional_i64(arguments, "payment_type")?
            .ok_or_else(|| ExecutionError::MissingArgument("payment_type".to_string()))?;
        let amount = required_f64(arguments, "amount")?;
        if amount <= 0.0 {
            return Err(invalid("amount", "must be positive"));
        }

        let receipt = self.require_receipt()?;
        receipt.paid += amount;
        if payment_type == PAYMENT_CASH {
            receipt.paid_cash += amount;
        }
        Ok(ExecutionOutput::message(format!("payment {amount:.2} added")))
    }

    fn receipt_close(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let receipt = self.require_receipt()?;
        let total = receipt.total();
        if receipt.paid + MONEY_EPSILON < total {
            return Err(ExecutionError::device(NOT_FULLY_PAID, "receipt is not fully paid"));
        }
        let change = (receipt.paid - total).max(0.0);
        let cash_kept = (receipt.paid_cash - change).max(0.0);
        self.require_paper()?;

        let document = self.next_document();
        self.cash_balance += cash_kept;
        self.receipt = None;
        let (shift_number, receipt_number) = match self.shift.as_mut() {
            Some(shift) => {
                shift.receipts += 1;
                (shift.number, shift.receipts)
            }
            None => (self.last_shift_number, 0),
        };

        Ok(ExecutionOutput::data(json!({
            "fiscal_document_number": document,
            "fiscal_document_sign": document_sign(document),
            "fiscal_storage_number": FISCAL_STORAGE_NUMBER,
            "shift_number": shift_number,
            "receipt_number": receipt_number,
            "fiscal_document_datetime": Utc::now().to_rfc3339(),
            "total": total,
            "change": change,
        }))
        .with_message("receipt closed and printed"))
    }

    fn receipt_cancel(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        self.require_receipt()?;
        self.receipt = None;
        Ok(ExecutionOutput::message("receipt cancelled"))
    }

    fn cash_in(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        let amount = self.cash_operation(arguments)?;
        self.cash_balance += amount;
        self.next_document();
        Ok(ExecutionOutput::message(format!("cash in {amount:.2} done")))
    }

    fn cash_out(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        let amount = self.cash_operation(arguments)?;
        if amount > self.cash_balance + MONEY_EPSILON {
            return Err(ExecutionError::device(NO_CASH, "not enough cash in the drawer"));
        }
        self.cash_balance -= amount;
        self.next_document();
        Ok(ExecutionOutput::message(format!("cash out {amount:.2} done")))
    }

    fn cash_drawer_open(&mut self, _: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        Ok(ExecutionOutput::message("cash drawer open command sent"))
    }

    fn print_text(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let text = required_str(arguments, "text")?;
        optional_i64(arguments, "alignment")?;
        optional_i64(arguments, "wrap")?;
        self.require_paper()?;
        self.print(text);
        Ok(ExecutionOutput::message("text printed"))
    }

    fn print_barcode(&mut self, arguments: &Arguments) -> Result<ExecutionOutput, ExecutionError> {
        self.require_connection()?;
        let barcode = required_str(arguments, "barcode")?;
        let barcode_type = optional_i64(arguments, "barcode_type")?
            .ok_or_else(|| ExecutionError::MissingArgument("barcode_type".to_string()))?;
        self.require_paper()?;
        self.print(&format!("[barcode {barcode_type}] {barcode}"));
        Ok(ExecutionOutput::message("barcode printed"))
    }

    // ── guards ──────────────────────────────────────────────────────────────

    fn cash_operation(&mut self, arguments: &Arguments) -> Result<f64, ExecutionError> {
        self.require_connection()?;
        let amount = required_f64(arguments, "amount")?;
        required_str(arguments, "cashier_name")?;
        if amount <= 0.0 {
            return Err(invalid("amount", "must be positive"));
        }
        self.require_shift()?;
        self.require_no_receipt()?;
        self.require_paper()?;
        Ok(amount)
    }

    fn require_connection(&self) -> Result<(), ExecutionError> {
        if self.connected {
            Ok(())
        } else {
            Err(ExecutionError::device(CONNECTION_DISABLED, "connection is not established"))
        }
    }

    fn require_paper(&self) -> Result<(), ExecutionError> {
        if self.paper {
            Ok(())
        } else {
            Err(ExecutionError::device(NO_PAPER, "out of paper"))
        }
    }

    fn require_shift(&self) -> Result<&OpenShift, ExecutionError> {
        self.shift
            .as_ref()
            .ok_or_else(|| ExecutionError::device(DENIED_IN_CLOSED_SHIFT, "denied in closed shift"))
    }

    fn require_receipt(&mut self) -> Result<&mut OpenReceipt, ExecutionError> {
        self.receipt
            .as_mut()
            .ok_or_else(|| ExecutionError::device(DENIED_IN_CLOSED_RECEIPT, "denied in closed receipt"))
    }

    fn require_no_receipt(&self) -> Result<(), ExecutionError> {
        match self.receipt {
            Some(_) => Err(ExecutionError::device(DENIED_IN_OPENED_RECEIPT, "denied in opened receipt")),
            None => Ok(()),
        }
    }

    fn next_document(&mut self) -> u64 {
        self.fiscal_document_number += 1;
        self.fiscal_document_number
    }

    fn print(&mut self, line: &str) {
        self.printed_lines.push(line.to_string());
    }
}

fn document_sign(document: u64) -> u64 {
    document.wrapping_mul(2_654_435_761) % 4_294_967_291
}

fn invalid(name: &str, reason: &str) -> ExecutionError {
    ExecutionError::InvalidArgument {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
