use crate::ReversalError;
use gxc_core::{floor_to_satoshi, from_satoshis, now_ts, Address, Coin, Hash32};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Standard reversal fee, 1000 satoshi.
pub const STANDARD_FEE: Coin = 0.00001;
/// Default share of every non-burned transaction fee routed to the pool.
pub const DEFAULT_TX_FEE_SPLIT: f64 = 0.15;
/// Default share of a recovered amount deposited back after execution.
pub const DEFAULT_EXEC_FEE: f64 = 0.002;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRecord {
    pub tx_hash: Hash32,
    pub from_address: Address,
    pub amount: Coin,
    pub timestamp: u64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeRecord {
    pub reversal_tx_hash: Hash32,
    pub fee_amount: Coin,
    pub timestamp: u64,
    pub victim_address: Address,
    pub admin_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub address: Address,
    pub balance: Coin,
    pub total_funded: Coin,
    pub total_spent: Coin,
    pub total_reversals: u32,
    pub average_fee: Coin,
    pub is_balance_low: bool,
    pub funding_count: usize,
}

/// Self-sustaining reversal fee pool. Funded automatically from transaction
/// fee splits and reversal execution fees; manual funding is legacy only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalFeePool {
    pub address: Address,
    balance: Coin,
    total_funded: Coin,
    total_spent: Coin,
    total_reversals: u32,
    funding_log: Vec<FundingRecord>,
    fee_log: Vec<FeeRecord>,
    /// Warn when the balance drops below this.
    min_warn: Coin,
    /// Minimum fee per reversal.
    min_fee: Coin,
}

impl ReversalFeePool {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0.0,
            total_funded: 0.0,
            total_spent: 0.0,
            total_reversals: 0,
            funding_log: Vec::new(),
            fee_log: Vec::new(),
            min_warn: 10.0 * STANDARD_FEE,
            min_fee: STANDARD_FEE,
        }
    }

    pub fn balance(&self) -> Coin {
        self.balance
    }

    pub fn total_funded(&self) -> Coin {
        self.total_funded
    }

    pub fn total_spent(&self) -> Coin {
        self.total_spent
    }

    pub fn total_reversals(&self) -> u32 {
        self.total_reversals
    }

    pub fn min_fee(&self) -> Coin {
        self.min_fee
    }

    pub fn set_min_warn(&mut self, amount: Coin) {
        self.min_warn = amount;
    }

    pub fn has_sufficient_funds(&self, fee: Coin) -> bool {
        self.balance + gxc_core::AMOUNT_EPSILON >= fee
    }

    pub fn is_balance_low(&self) -> bool {
        self.balance < self.min_warn
    }

    /// Automatic deposit of the pool's share of a transaction fee. The
    /// split is bounded to [0.10, 0.20]. Returns the amount deposited.
    pub fn deposit_tx_fee_split(&mut self, tx_hash: Hash32, fee_amount: Coin, split: f64) -> Coin {
        let split = split.clamp(0.10, 0.20);
        let deposit = floor_to_satoshi(fee_amount * split);
        if deposit <= 0.0 {
            return 0.0;
        }
        self.credit(deposit);
        self.funding_log.push(FundingRecord {
            tx_hash,
            from_address: "fee-split".to_string(),
            amount: deposit,
            timestamp: now_ts(),
            note: String::new(),
        });
        deposit
    }

    /// Automatic deposit after a successful reversal: a 0.1-0.3% cut of the
    /// recovered amount. Returns the amount deposited.
    pub fn deposit_reversal_exec_fee(&mut self, reversal_tx: Hash32, recovered: Coin, percentage: f64) -> Coin {
        let percentage = percentage.clamp(0.001, 0.003);
        let deposit = floor_to_satoshi(recovered * percentage);
        if deposit <= 0.0 {
            return 0.0;
        }
        self.credit(deposit);
        self.funding_log.push(FundingRecord {
            tx_hash: reversal_tx,
            from_address: "exec-fee".to_string(),
            amount: deposit,
            timestamp: now_ts(),
            note: String::new(),
        });
        info!(amount = deposit, "execution fee deposited to pool");
        deposit
    }

    /// Legacy manual funding from an external wallet.
    pub fn record_manual_funding(&mut self, tx_hash: Hash32, from: &str, amount: Coin, note: &str) {
        self.credit(amount);
        self.funding_log.push(FundingRecord {
            tx_hash,
            from_address: from.to_string(),
            amount,
            timestamp: now_ts(),
            note: note.to_string(),
        });
    }

    fn credit(&mut self, amount: Coin) {
        self.balance = floor_to_satoshi(self.balance + amount);
        self.total_funded = floor_to_satoshi(self.total_funded + amount);
    }

    /// Pay a reversal fee out of the pool.
    pub fn deduct_fee(
        &mut self,
        reversal_tx: Hash32,
        amount: Coin,
        victim: &str,
        admin_id: &str,
    ) -> Result<(), ReversalError> {
        if amount + gxc_core::AMOUNT_EPSILON < self.min_fee {
            return Err(ReversalError::FeeBelowMinimum);
        }
        if !self.has_sufficient_funds(amount) {
            warn!(balance = self.balance, required = amount, "pool cannot cover reversal fee");
            return Err(ReversalError::InsufficientPoolBalance);
        }
        self.balance = floor_to_satoshi(self.balance - amount);
        self.total_spent = floor_to_satoshi(self.total_spent + amount);
        self.total_reversals += 1;
        self.fee_log.push(FeeRecord {
            reversal_tx_hash: reversal_tx,
            fee_amount: amount,
            timestamp: now_ts(),
            victim_address: victim.to_string(),
            admin_id: admin_id.to_string(),
        });
        if self.is_balance_low() {
            warn!(balance = self.balance, "reversal fee pool balance low");
        }
        Ok(())
    }

    pub fn funding_log(&self) -> &[FundingRecord] {
        &self.funding_log
    }

    pub fn fee_log(&self) -> &[FeeRecord] {
        &self.fee_log
    }

    pub fn statistics(&self) -> PoolStats {
        PoolStats {
            address: self.address.clone(),
            balance: self.balance,
            total_funded: self.total_funded,
            total_spent: self.total_spent,
            total_reversals: self.total_reversals,
            average_fee: if self.total_reversals == 0 {
                0.0
            } else {
                self.total_spent / self.total_reversals as f64
            },
            is_balance_low: self.is_balance_low(),
            funding_count: self.funding_log.len(),
        }
    }

    /// `|`-separated line export: a state line, then funding and fee lines.
    /// Amounts are written in satoshis so the format survives round-trips.
    pub fn export_lines(&self) -> String {
        let mut out = format!(
            "POOL|{}|{}|{}|{}|{}|{}|{}\n",
            self.address,
            gxc_core::to_satoshis(self.balance),
            gxc_core::to_satoshis(self.total_funded),
            gxc_core::to_satoshis(self.total_spent),
            self.total_reversals,
            gxc_core::to_satoshis(self.min_warn),
            gxc_core::to_satoshis(self.min_fee),
        );
        for f in &self.funding_log {
            out.push_str(&format!(
                "FUND|{}|{}|{}|{}|{}\n",
                hex::encode(f.tx_hash),
                f.from_address,
                gxc_core::to_satoshis(f.amount),
                f.timestamp,
                f.note
            ));
        }
        for f in &self.fee_log {
            out.push_str(&format!(
                "FEE|{}|{}|{}|{}|{}\n",
                hex::encode(f.reversal_tx_hash),
                gxc_core::to_satoshis(f.fee_amount),
                f.timestamp,
                f.victim_address,
                f.admin_id
            ));
        }
        out
    }

    pub fn import_lines(data: &str) -> Option<Self> {
        let mut pool: Option<Self> = None;
        for line in data.lines() {
            let fields: Vec<&str> = line.split('|').collect();
            match fields.first() {
                Some(&"POOL") if fields.len() == 8 => {
                    let mut p = Self::new(fields[1].to_string());
                    p.balance = from_satoshis(fields[2].parse().ok()?);
                    p.total_funded = from_satoshis(fields[3].parse().ok()?);
                    p.total_spent = from_satoshis(fields[4].parse().ok()?);
                    p.total_reversals = fields[5].parse().ok()?;
                    p.min_warn = from_satoshis(fields[6].parse().ok()?);
                    p.min_fee = from_satoshis(fields[7].parse().ok()?);
                    pool = Some(p);
                }
                Some(&"FUND") if fields.len() == 6 => {
                    let p = pool.as_mut()?;
                    p.funding_log.push(FundingRecord {
                        tx_hash: gxc_core::hash_from_hex(fields[1]).ok()?,
                        from_address: fields[2].to_string(),
                        amount: from_satoshis(fields[3].parse().ok()?),
                        timestamp: fields[4].parse().ok()?,
                        note: fields[5].to_string(),
                    });
                }
                Some(&"FEE") if fields.len() == 6 => {
                    let p = pool.as_mut()?;
                    p.fee_log.push(FeeRecord {
                        reversal_tx_hash: gxc_core::hash_from_hex(fields[1]).ok()?,
                        fee_amount: from_satoshis(fields[2].parse().ok()?),
                        timestamp: fields[3].parse().ok()?,
                        victim_address: fields[4].to_string(),
                        admin_id: fields[5].to_string(),
                    });
                }
                _ => return None,
            }
        }
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gxc_core::amounts_equal;

    #[test]
    fn fee_split_deposits_floor_at_satoshis() {
        let mut pool = ReversalFeePool::new("GXCpool".into());
        let deposited = pool.deposit_tx_fee_split([1u8; 32], 0.001, 0.15);
        assert!(amounts_equal(deposited, 0.00015));
        assert!(amounts_equal(pool.balance(), 0.00015));
        // Split is clamped into [0.10, 0.20].
        let clamped = pool.deposit_tx_fee_split([2u8; 32], 1.0, 0.5);
        assert!(amounts_equal(clamped, 0.2));
    }

    #[test]
    fn exec_fee_deposit() {
        let mut pool = ReversalFeePool::new("GXCpool".into());
        let deposited = pool.deposit_reversal_exec_fee([3u8; 32], 16.0, 0.002);
        assert!(amounts_equal(deposited, 0.032));
        assert!(amounts_equal(pool.total_funded(), 0.032));
    }

    #[test]
    fn deduct_fee_enforces_minimum_and_balance() {
        let mut pool = ReversalFeePool::new("GXCpool".into());
        assert_eq!(
            pool.deduct_fee([4u8; 32], STANDARD_FEE / 2.0, "GXCv", "admin"),
            Err(ReversalError::FeeBelowMinimum)
        );
        assert_eq!(
            pool.deduct_fee([4u8; 32], STANDARD_FEE, "GXCv", "admin"),
            Err(ReversalError::InsufficientPoolBalance)
        );
        pool.record_manual_funding([5u8; 32], "GXCdonor", 1.0, "bootstrap");
        pool.deduct_fee([4u8; 32], STANDARD_FEE, "GXCv", "admin").unwrap();
        assert!(amounts_equal(pool.balance(), 1.0 - STANDARD_FEE));
        assert_eq!(pool.total_reversals(), 1);
        assert_eq!(pool.fee_log().len(), 1);
    }

    #[test]
    fn low_balance_warning_threshold() {
        let mut pool = ReversalFeePool::new("GXCpool".into());
        assert!(pool.is_balance_low());
        pool.record_manual_funding([6u8; 32], "GXCdonor", 1.0, "");
        assert!(!pool.is_balance_low());
    }

    #[test]
    fn line_format_roundtrip() {
        let mut pool = ReversalFeePool::new("GXCpool".into());
        pool.record_manual_funding([7u8; 32], "GXCdonor", 2.5, "seed");
        pool.deposit_tx_fee_split([8u8; 32], 0.01, 0.15);
        pool.deduct_fee([9u8; 32], STANDARD_FEE, "GXCvictim", "admin-1").unwrap();

        let lines = pool.export_lines();
        let back = ReversalFeePool::import_lines(&lines).unwrap();
        assert!(amounts_equal(back.balance(), pool.balance()));
        assert_eq!(back.funding_log(), pool.funding_log());
        assert_eq!(back.fee_log(), pool.fee_log());
        assert_eq!(back.export_lines(), lines);
    }

    #[test]
    fn import_rejects_garbage() {
        assert!(ReversalFeePool::import_lines("JUNK|1|2\n").is_none());
    }
}
