//! Durable voucher ledger and settlement records, backed by SQLite.
//!
//! The store is the single source of truth for voucher-nonce uniqueness:
//! the UNIQUE constraint, not application logic, decides races. Settlement
//! finalization is idempotent on the transaction hash so the chain write
//! and the ledger write straddling two systems of record cannot
//! double-settle.

use std::sync::Mutex;

use alloy::primitives::{Address, FixedBytes, U256};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::FacilitatorError;
use crate::voucher::{AccumulatedBalance, SettlementRecord, VoucherData, VoucherRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vouchers (
    id TEXT PRIMARY KEY,
    payer TEXT NOT NULL,
    payee TEXT NOT NULL,
    amount TEXT NOT NULL,
    nonce TEXT NOT NULL UNIQUE,
    signature TEXT NOT NULL,
    valid_until INTEGER NOT NULL,
    settled INTEGER NOT NULL DEFAULT 0,
    network TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vouchers_pair
    ON vouchers(payee, payer, network, settled);

CREATE TABLE IF NOT EXISTS settlements (
    id TEXT PRIMARY KEY,
    tx_hash TEXT NOT NULL UNIQUE,
    payer TEXT NOT NULL,
    payee TEXT NOT NULL,
    total_amount TEXT NOT NULL,
    voucher_count INTEGER NOT NULL,
    voucher_ids TEXT NOT NULL,
    network TEXT NOT NULL,
    settled_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_settlements_payee
    ON settlements(payee, network, settled_at);
";

/// SQLite-backed voucher ledger.
pub struct VoucherStore {
    conn: Mutex<Connection>,
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_address(s: &str) -> Result<Address, FacilitatorError> {
    s.parse::<Address>()
        .map_err(|e| FacilitatorError::Store(format!("corrupt address in ledger: {e}")))
}

fn parse_amount(s: &str) -> Result<U256, FacilitatorError> {
    s.parse::<U256>()
        .map_err(|e| FacilitatorError::Store(format!("corrupt amount in ledger: {e}")))
}

impl VoucherStore {
    /// Open (or create) the voucher database at `path`.
    pub fn open(path: &str) -> Result<Self, FacilitatorError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("voucher store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Persist an accepted voucher. Fails with
    /// [`FacilitatorError::DuplicateNonce`] when the nonce already exists;
    /// the losing side of a concurrent race gets the same answer.
    pub fn store(
        &self,
        voucher: &VoucherData,
        signature: &str,
        network: &str,
    ) -> Result<VoucherRecord, FacilitatorError> {
        let amount = voucher
            .amount
            .parse::<U256>()
            .map_err(|e| FacilitatorError::InvalidPayment(format!("invalid amount: {e}")))?;

        let record = VoucherRecord {
            id: Uuid::new_v4().to_string(),
            payer: voucher.payer,
            payee: voucher.payee,
            amount,
            nonce: voucher.nonce,
            signature: signature.to_string(),
            valid_until: voucher.valid_until,
            settled: false,
            network: network.to_string(),
            created_at: unix_now(),
        };

        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO vouchers
                (id, payer, payee, amount, nonce, signature, valid_until, settled, network, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
            params![
                record.id,
                format!("{:#x}", record.payer),
                format!("{:#x}", record.payee),
                record.amount.to_string(),
                format!("{:#x}", record.nonce),
                record.signature,
                record.valid_until as i64,
                record.network,
                record.created_at,
            ],
        );

        match result {
            Ok(_) => Ok(record),
            Err(e) if is_unique_violation(&e) => Err(FacilitatorError::DuplicateNonce),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a voucher by its nonce.
    pub fn get_by_nonce(
        &self,
        nonce: &FixedBytes<32>,
    ) -> Result<Option<VoucherRecord>, FacilitatorError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, payer, payee, amount, nonce, signature, valid_until, settled, network, created_at
             FROM vouchers WHERE nonce = ?1",
            [format!("{:#x}", nonce)],
            row_to_voucher,
        )
        .optional()?
        .transpose()
    }

    /// Unsettled vouchers for a payer/payee pair, oldest first so
    /// aggregation is fair to early vouchers.
    pub fn get_unsettled(
        &self,
        payer: Address,
        payee: Address,
        network: &str,
    ) -> Result<Vec<VoucherRecord>, FacilitatorError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, payer, payee, amount, nonce, signature, valid_until, settled, network, created_at
             FROM vouchers
             WHERE payer = ?1 AND payee = ?2 AND network = ?3 AND settled = 0
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(
            params![format!("{:#x}", payer), format!("{:#x}", payee), network],
            row_to_voucher,
        )?;
        rows.collect::<Result<Result<Vec<_>, _>, _>>()?
    }

    /// Unsettled value owed to a payee, grouped by payer.
    pub fn accumulated_balances(
        &self,
        payee: Address,
        network: &str,
    ) -> Result<Vec<AccumulatedBalance>, FacilitatorError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, payer, payee, amount, nonce, signature, valid_until, settled, network, created_at
             FROM vouchers
             WHERE payee = ?1 AND network = ?2 AND settled = 0
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![format!("{:#x}", payee), network], row_to_voucher)?;
        let records: Vec<VoucherRecord> = rows.collect::<Result<Result<Vec<_>, _>, _>>()??;
        drop(stmt);
        drop(conn);

        let mut by_payer: Vec<AccumulatedBalance> = Vec::new();
        for record in records {
            match by_payer.iter_mut().find(|b| b.payer == record.payer) {
                Some(balance) => {
                    let total = parse_amount(&balance.total_amount)?.saturating_add(record.amount);
                    balance.total_amount = total.to_string();
                    balance.voucher_count += 1;
                    balance.voucher_ids.push(record.id);
                }
                None => by_payer.push(AccumulatedBalance {
                    payer: record.payer,
                    payee,
                    total_amount: record.amount.to_string(),
                    voucher_count: 1,
                    voucher_ids: vec![record.id],
                }),
            }
        }
        Ok(by_payer)
    }

    /// Idempotency lookup: the settlement previously written for this
    /// transaction hash, if any.
    pub fn settlement_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<SettlementRecord>, FacilitatorError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, tx_hash, payer, payee, total_amount, voucher_count, voucher_ids, network, settled_at
             FROM settlements WHERE tx_hash = ?1",
            [tx_hash],
            row_to_settlement,
        )
        .optional()?
        .transpose()
    }

    /// Settlement history for a payee, newest first.
    pub fn payee_settlements(
        &self,
        payee: Address,
        network: &str,
    ) -> Result<Vec<SettlementRecord>, FacilitatorError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, tx_hash, payer, payee, total_amount, voucher_count, voucher_ids, network, settled_at
             FROM settlements
             WHERE payee = ?1 AND network = ?2
             ORDER BY settled_at DESC",
        )?;
        let rows = stmt.query_map(params![format!("{:#x}", payee), network], row_to_settlement)?;
        rows.collect::<Result<Result<Vec<_>, _>, _>>()?
    }

    /// Atomically record a confirmed settlement and flip its vouchers to
    /// settled.
    ///
    /// Retryable to completion: when a record for `tx_hash` already exists
    /// (a previous attempt crashed between the chain call and this write),
    /// the voucher flip is re-applied and the existing record returned;
    /// the on-chain transfer is never repeated.
    pub fn finalize_settlement(
        &self,
        tx_hash: &str,
        payer: Address,
        payee: Address,
        total: U256,
        voucher_ids: &[String],
        network: &str,
    ) -> Result<SettlementRecord, FacilitatorError> {
        if let Some(existing) = self.settlement_by_tx_hash(tx_hash)? {
            tracing::warn!(
                tx = %tx_hash,
                "settlement record already exists; re-applying voucher flags only"
            );
            self.mark_settled(voucher_ids)?;
            return Ok(existing);
        }

        let record = SettlementRecord {
            id: Uuid::new_v4().to_string(),
            tx_hash: tx_hash.to_string(),
            payer,
            payee,
            total_amount: total.to_string(),
            voucher_count: voucher_ids.len(),
            voucher_ids: voucher_ids.to_vec(),
            network: network.to_string(),
            settled_at: unix_now(),
        };

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO settlements
                (id, tx_hash, payer, payee, total_amount, voucher_count, voucher_ids, network, settled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.tx_hash,
                format!("{:#x}", record.payer),
                format!("{:#x}", record.payee),
                record.total_amount,
                record.voucher_count as i64,
                serde_json::to_string(&record.voucher_ids)?,
                record.network,
                record.settled_at,
            ],
        )?;
        for id in voucher_ids {
            tx.execute("UPDATE vouchers SET settled = 1 WHERE id = ?1", [id])?;
        }
        tx.commit()?;

        Ok(record)
    }

    fn mark_settled(&self, voucher_ids: &[String]) -> Result<(), FacilitatorError> {
        let conn = self.conn();
        for id in voucher_ids {
            conn.execute("UPDATE vouchers SET settled = 1 WHERE id = ?1", [id])?;
        }
        Ok(())
    }

    /// Delete unsettled vouchers whose validity has lapsed. Runs off the
    /// request path. Returns the number deleted.
    pub fn delete_expired(&self, now: u64) -> Result<usize, FacilitatorError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM vouchers WHERE settled = 0 AND valid_until < ?1",
            [now as i64],
        )?;
        Ok(deleted)
    }
}

fn row_to_voucher(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<VoucherRecord, FacilitatorError>> {
    let id: String = row.get(0)?;
    let payer: String = row.get(1)?;
    let payee: String = row.get(2)?;
    let amount: String = row.get(3)?;
    let nonce: String = row.get(4)?;
    let signature: String = row.get(5)?;
    let valid_until: i64 = row.get(6)?;
    let settled: i64 = row.get(7)?;
    let network: String = row.get(8)?;
    let created_at: i64 = row.get(9)?;

    let build = || -> Result<VoucherRecord, FacilitatorError> {
        Ok(VoucherRecord {
            id,
            payer: parse_address(&payer)?,
            payee: parse_address(&payee)?,
            amount: parse_amount(&amount)?,
            nonce: nonce
                .parse::<FixedBytes<32>>()
                .map_err(|e| FacilitatorError::Store(format!("corrupt nonce in ledger: {e}")))?,
            signature,
            valid_until: valid_until as u64,
            settled: settled != 0,
            network,
            created_at,
        })
    };
    Ok(build())
}

fn row_to_settlement(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<SettlementRecord, FacilitatorError>> {
    let id: String = row.get(0)?;
    let tx_hash: String = row.get(1)?;
    let payer: String = row.get(2)?;
    let payee: String = row.get(3)?;
    let total_amount: String = row.get(4)?;
    let voucher_count: i64 = row.get(5)?;
    let voucher_ids_json: String = row.get(6)?;
    let network: String = row.get(7)?;
    let settled_at: i64 = row.get(8)?;

    let build = || -> Result<SettlementRecord, FacilitatorError> {
        Ok(SettlementRecord {
            id,
            tx_hash,
            payer: parse_address(&payer)?,
            payee: parse_address(&payee)?,
            total_amount,
            voucher_count: voucher_count as usize,
            voucher_ids: serde_json::from_str(&voucher_ids_json)?,
            network,
            settled_at,
        })
    };
    Ok(build())
}
