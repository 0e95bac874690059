//! Token quantities and the (contract, quantity) pair a deal is priced in
use crate::deal::PartyId;
use crate::error::ValidationError;
use std::fmt;
use std::str::FromStr;

/// Largest magnitude a quantity may carry, `2^62 - 1`.
pub const MAX_AMOUNT: i64 = (1 << 62) - 1;
pub const MAX_PRECISION: u8 = 18;
const MAX_SYMBOL_LEN: usize = 7;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    #[n(0)]
    code: String,
    #[n(1)]
    precision: u8,
}

/// An amount in the smallest unit of its symbol, e.g. `1000000` of `4,EOS` is `100.0000 EOS`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Quantity {
    #[n(0)]
    pub amount: i64,
    #[n(1)]
    pub symbol: Symbol,
}

/// A quantity qualified by the token ledger that issues it.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ExtendedAsset {
    #[n(0)]
    pub contract: PartyId,
    #[n(1)]
    pub quantity: Quantity,
}

impl Symbol {
    pub fn new(code: &str, precision: u8) -> Self {
        Self {
            code: code.to_string(),
            precision,
        }
    }
    pub fn code(&self) -> &str {
        &self.code
    }
    pub fn precision(&self) -> u8 {
        self.precision
    }
    pub fn is_valid(&self) -> bool {
        !self.code.is_empty()
            && self.code.len() <= MAX_SYMBOL_LEN
            && self.code.bytes().all(|b| b.is_ascii_uppercase())
            && self.precision <= MAX_PRECISION
    }
}

impl Quantity {
    pub fn new(amount: i64, symbol: Symbol) -> Self {
        Self { amount, symbol }
    }
    pub fn is_valid(&self) -> bool {
        self.symbol.is_valid() && (-MAX_AMOUNT..=MAX_AMOUNT).contains(&self.amount)
    }
    /// Well-formed and strictly positive, the requirement for a deal price.
    pub fn validate_price(&self) -> Result<(), ValidationError> {
        if !self.is_valid() {
            return Err(ValidationError::InvalidQuantity(self.to_string()));
        }
        if self.amount <= 0 {
            return Err(ValidationError::NonPositiveQuantity);
        }
        Ok(())
    }
}

impl ExtendedAsset {
    pub fn new(contract: PartyId, quantity: Quantity) -> Self {
        Self { contract, quantity }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.precision, self.code)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        let precision = self.symbol.precision as u32;
        match 10u64.checked_pow(precision) {
            Some(scale) if precision > 0 => write!(
                f,
                "{sign}{}.{:0>width$} {}",
                abs / scale,
                abs % scale,
                self.symbol.code,
                width = precision as usize
            ),
            _ => write!(f, "{sign}{abs} {}", self.symbol.code),
        }
    }
}

impl fmt::Display for ExtendedAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.quantity, self.contract)
    }
}

// Parses the ledger's textual form, "100.0000 EOS".
impl FromStr for Quantity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidQuantity(s.to_string());

        let (number, code) = s.trim().split_once(' ').ok_or_else(invalid)?;
        let (negative, number) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number),
        };
        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() || !(whole.bytes().chain(frac.bytes())).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let precision = u8::try_from(frac.len()).map_err(|_| invalid())?;
        let digits = format!("{whole}{frac}");
        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        let amount = if negative { -amount } else { amount };

        let quantity = Quantity::new(amount, Symbol::new(code.trim(), precision));
        if !quantity.is_valid() {
            return Err(invalid());
        }
        Ok(quantity)
    }
}
