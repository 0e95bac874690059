//! The deal record, its terms builder and the state derived from its flags
use crate::asset::{ExtendedAsset, Quantity};
use crate::error::ValidationError;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;

pub const SECONDS_PER_DAY: i64 = 24 * 3600;

/// An account name on the host ledger.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cbor(transparent)]
pub struct PartyId(#[n(0)] String);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>)
where
    T::Offset: Copy;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Excluded from sweeping; paired with the arbitration flag.
    #[n(0)]
    Locked,
    #[n(1)]
    At(#[n(0)] TimeStamp<Utc>),
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cbor(transparent)]
pub struct DealFlags(#[n(0)] u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Buyer,
    Seller,
    Arbiter,
}

/// Where a live deal sits in its lifecycle. Terminal outcomes are never stored,
/// the record is deleted and the final notification carries the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealState {
    Proposed,
    BothAccepted,
    Funded,
    Delivered,
    Arbitration,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Deal {
    #[n(0)]
    id: u64,
    #[n(1)]
    created_by: PartyId,
    #[n(2)]
    description: String,
    #[n(3)]
    price: ExtendedAsset,
    #[n(4)]
    buyer: PartyId,
    #[n(5)]
    seller: PartyId,
    #[n(6)]
    arbiter: PartyId,
    #[n(7)]
    delivery_days: u32,
    #[n(8)]
    funded_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    expires: Expiry,
    #[n(10)]
    flags: DealFlags,
}

// Used for drafting a deal before it is proposed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DealTerms {
    description: Option<String>,
    token_contract: Option<PartyId>,
    quantity: Option<Quantity>,
    buyer: Option<PartyId>,
    seller: Option<PartyId>,
    arbiter: Option<PartyId>,
    delivery_days: u32,
}

impl PartyId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn from_unix(secs: i64) -> Self {
        Self(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Whole days of 86 400 seconds, independent of calendar irregularities.
    /// `None` past [`TimeStamp::latest`].
    pub fn checked_plus_days(&self, days: u32) -> Option<Self> {
        self.checked_add(TimeDelta::try_seconds(days as i64 * SECONDS_PER_DAY)?)
    }
    /// Saturating form of [`TimeStamp::checked_plus_days`].
    pub fn plus_days(&self, days: u32) -> Self {
        self.checked_plus_days(days).unwrap_or_else(Self::latest)
    }
    /// `None` when the sum has no `i64` nanosecond encoding.
    pub fn checked_add(&self, delta: TimeDelta) -> Option<Self> {
        self.0
            .checked_add_signed(delta)
            .filter(|dt| dt.timestamp_nanos_opt().is_some())
            .map(Self)
    }
    /// The last instant the store can encode.
    pub fn latest() -> Self {
        Self(DateTime::from_timestamp_nanos(i64::MAX))
    }
    pub fn earliest() -> Self {
        Self(DateTime::from_timestamp_nanos(i64::MIN))
    }
    /// Nanoseconds since the epoch, clamped to `1..` so that `0` stays free for
    /// the lock sentinel in the expiry index.
    pub fn index_nanos(&self) -> u64 {
        self.0.timestamp_nanos_opt().unwrap_or(i64::MAX).max(1) as u64
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<TimeDelta> for TimeStamp<Utc> {
    type Output = Self;

    /// Saturates at the encodable range. Transitions use the checked forms.
    fn add(self, rhs: TimeDelta) -> Self {
        self.checked_add(rhs).unwrap_or_else(|| {
            if rhs < TimeDelta::zero() {
                Self::earliest()
            } else {
                Self::latest()
            }
        })
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T>
where
    T::Offset: Copy,
{
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl Expiry {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
    pub fn at(&self) -> Option<TimeStamp<Utc>> {
        match self {
            Self::Locked => None,
            Self::At(ts) => Some(*ts),
        }
    }
    /// Sort position in the expiry index. The sentinel sorts first.
    pub fn index_nanos(&self) -> u64 {
        match self {
            Self::Locked => 0,
            Self::At(ts) => ts.index_nanos(),
        }
    }
    pub fn is_due(&self, now: TimeStamp<Utc>) -> bool {
        matches!(self, Self::At(ts) if *ts <= now)
    }
}

impl DealFlags {
    pub const BUYER_ACCEPTED: u16 = 1 << 0;
    pub const SELLER_ACCEPTED: u16 = 1 << 1;
    pub const FUNDED: u16 = 1 << 2;
    pub const DELIVERED: u16 = 1 << 3;
    pub const IN_ARBITRATION: u16 = 1 << 4;
    pub const BOTH_ACCEPTED: u16 = Self::BUYER_ACCEPTED | Self::SELLER_ACCEPTED;

    pub fn bits(&self) -> u16 {
        self.0
    }
    pub fn contains(&self, flags: u16) -> bool {
        self.0 & flags == flags
    }
    fn insert(&mut self, flags: u16) {
        self.0 |= flags;
    }
}

impl Role {
    pub fn accepted_flag(&self) -> Option<u16> {
        match self {
            Role::Buyer => Some(DealFlags::BUYER_ACCEPTED),
            Role::Seller => Some(DealFlags::SELLER_ACCEPTED),
            Role::Arbiter => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Buyer => write!(f, "buyer"),
            Role::Seller => write!(f, "seller"),
            Role::Arbiter => write!(f, "arbiter"),
        }
    }
}

impl DealTerms {
    /// Construct a new builder object, this becomes the basis for a proposal
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
    pub fn set_token_contract(mut self, contract: PartyId) -> Self {
        self.token_contract = Some(contract);
        self
    }
    pub fn set_quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = Some(quantity);
        self
    }
    pub fn set_buyer(mut self, buyer: PartyId) -> Self {
        self.buyer = Some(buyer);
        self
    }
    pub fn set_seller(mut self, seller: PartyId) -> Self {
        self.seller = Some(seller);
        self
    }
    pub fn set_arbiter(mut self, arbiter: PartyId) -> Self {
        self.arbiter = Some(arbiter);
        self
    }
    pub fn set_delivery_days(mut self, days: u32) -> Self {
        self.delivery_days = days;
        self
    }

    /// Checks everything that can be decided without the ledger: a non-empty
    /// description, a positive well-formed price, three distinct parties and a
    /// positive term. Returns the completed terms.
    pub fn validate(&self) -> Result<ValidTerms<'_>, ValidationError> {
        let description = self
            .description
            .as_deref()
            .ok_or(ValidationError::MissingField("description"))?;
        if description.trim().is_empty() {
            return Err(ValidationError::EmptyDescription);
        }
        let token_contract = self
            .token_contract
            .as_ref()
            .ok_or(ValidationError::MissingField("token_contract"))?;
        let quantity = self
            .quantity
            .as_ref()
            .ok_or(ValidationError::MissingField("quantity"))?;
        quantity.validate_price()?;

        let buyer = self.buyer.as_ref().ok_or(ValidationError::MissingField("buyer"))?;
        let seller = self.seller.as_ref().ok_or(ValidationError::MissingField("seller"))?;
        let arbiter = self
            .arbiter
            .as_ref()
            .ok_or(ValidationError::MissingField("arbiter"))?;
        if buyer == seller || buyer == arbiter || seller == arbiter {
            return Err(ValidationError::DuplicateParties);
        }
        if self.delivery_days == 0 {
            return Err(ValidationError::ZeroDays);
        }

        Ok(ValidTerms {
            description,
            token_contract,
            quantity,
            buyer,
            seller,
            arbiter,
            delivery_days: self.delivery_days,
        })
    }
}

/// Borrowed view of terms that passed [`DealTerms::validate`].
#[derive(Debug, Clone, Copy)]
pub struct ValidTerms<'a> {
    pub description: &'a str,
    pub token_contract: &'a PartyId,
    pub quantity: &'a Quantity,
    pub buyer: &'a PartyId,
    pub seller: &'a PartyId,
    pub arbiter: &'a PartyId,
    pub delivery_days: u32,
}

impl Deal {
    pub(crate) fn propose(
        id: u64,
        created_by: PartyId,
        terms: ValidTerms<'_>,
        expires: TimeStamp<Utc>,
    ) -> Self {
        let mut flags = DealFlags::default();
        if &created_by == terms.buyer {
            flags.insert(DealFlags::BUYER_ACCEPTED);
        } else if &created_by == terms.seller {
            flags.insert(DealFlags::SELLER_ACCEPTED);
        }

        Self {
            id,
            created_by,
            description: terms.description.to_string(),
            price: ExtendedAsset::new(terms.token_contract.clone(), terms.quantity.clone()),
            buyer: terms.buyer.clone(),
            seller: terms.seller.clone(),
            arbiter: terms.arbiter.clone(),
            delivery_days: terms.delivery_days,
            funded_at: None,
            expires: Expiry::At(expires),
            flags,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn created_by(&self) -> &PartyId {
        &self.created_by
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn price(&self) -> &ExtendedAsset {
        &self.price
    }
    pub fn buyer(&self) -> &PartyId {
        &self.buyer
    }
    pub fn seller(&self) -> &PartyId {
        &self.seller
    }
    pub fn arbiter(&self) -> &PartyId {
        &self.arbiter
    }
    pub fn delivery_days(&self) -> u32 {
        self.delivery_days
    }
    pub fn funded_at(&self) -> Option<TimeStamp<Utc>> {
        self.funded_at
    }
    pub fn expires(&self) -> Expiry {
        self.expires
    }
    pub fn flags(&self) -> DealFlags {
        self.flags
    }

    pub fn role_of(&self, party: &PartyId) -> Option<Role> {
        if party == &self.buyer {
            Some(Role::Buyer)
        } else if party == &self.seller {
            Some(Role::Seller)
        } else if party == &self.arbiter {
            Some(Role::Arbiter)
        } else {
            None
        }
    }
    pub fn party(&self, role: Role) -> &PartyId {
        match role {
            Role::Buyer => &self.buyer,
            Role::Seller => &self.seller,
            Role::Arbiter => &self.arbiter,
        }
    }

    pub fn is_fully_accepted(&self) -> bool {
        self.flags.contains(DealFlags::BOTH_ACCEPTED)
    }
    pub fn is_funded(&self) -> bool {
        self.flags.contains(DealFlags::FUNDED)
    }
    pub fn is_delivered(&self) -> bool {
        self.flags.contains(DealFlags::DELIVERED)
    }
    pub fn in_arbitration(&self) -> bool {
        self.flags.contains(DealFlags::IN_ARBITRATION)
    }

    pub fn state(&self) -> DealState {
        if self.in_arbitration() {
            DealState::Arbitration
        } else if self.is_delivered() {
            DealState::Delivered
        } else if self.is_funded() {
            DealState::Funded
        } else if self.is_fully_accepted() {
            DealState::BothAccepted
        } else {
            DealState::Proposed
        }
    }

    pub(crate) fn set_accepted(&mut self, flag: u16) {
        self.flags.insert(flag);
    }

    pub(crate) fn mark_funded(&mut self, now: TimeStamp<Utc>) -> Result<(), ValidationError> {
        let due = now
            .checked_plus_days(self.delivery_days)
            .ok_or(ValidationError::TermOverflow)?;
        self.advance_expiry(due)?;
        self.funded_at = Some(now);
        self.flags.insert(DealFlags::FUNDED);
        Ok(())
    }

    pub(crate) fn mark_delivered(&mut self, expires: TimeStamp<Utc>) -> Result<(), ValidationError> {
        self.advance_expiry(expires)?;
        self.flags.insert(DealFlags::DELIVERED);
        Ok(())
    }

    /// Leaves the deal untouched when the longer term cannot be represented.
    pub(crate) fn extend_term(&mut self, more_days: u32) -> Result<(), ValidationError> {
        let days = self
            .delivery_days
            .checked_add(more_days)
            .ok_or(ValidationError::TermOverflow)?;
        if let Some(funded_at) = self.funded_at {
            let due = funded_at
                .checked_plus_days(days)
                .ok_or(ValidationError::TermOverflow)?;
            self.advance_expiry(due)?;
        }
        self.delivery_days = days;
        Ok(())
    }

    /// The only way the lock sentinel and the arbitration flag are ever set.
    pub(crate) fn lock_for_arbitration(&mut self) {
        self.expires = Expiry::Locked;
        self.flags.insert(DealFlags::IN_ARBITRATION);
    }

    /// Moves the expiry to `target`, or one second past the current expiry when
    /// `target` would not move it forward.
    pub(crate) fn advance_expiry(&mut self, target: TimeStamp<Utc>) -> Result<(), ValidationError> {
        self.expires = match self.expires {
            Expiry::At(current) if target <= current => Expiry::At(
                current
                    .checked_add(TimeDelta::seconds(1))
                    .ok_or(ValidationError::ExpiryOutOfRange)?,
            ),
            _ => Expiry::At(target),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Symbol;

    fn terms() -> DealTerms {
        DealTerms::new()
            .set_description("a bicycle")
            .set_token_contract("eosio.token".into())
            .set_quantity(Quantity::new(1_000_000, Symbol::new("EOS", 4)))
            .set_buyer("alice".into())
            .set_seller("bob".into())
            .set_arbiter("carol".into())
            .set_delivery_days(5)
    }

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn deal_encoding_keeps_every_field() {
        let now = TimeStamp::from_unix(1_700_000_000);
        let mut deal = Deal::propose(7, "alice".into(), terms().validate().unwrap(), now);
        deal.set_accepted(DealFlags::SELLER_ACCEPTED);
        deal.mark_funded(now).unwrap();

        let decoded: Deal = minicbor::decode(&minicbor::to_vec(&deal).unwrap()).unwrap();
        assert_eq!(decoded, deal);
        assert_eq!(decoded.state(), DealState::Funded);
    }

    #[test]
    fn creator_acceptance_follows_role() {
        let now = TimeStamp::from_unix(1_700_000_000);
        let valid = terms();
        let valid = valid.validate().unwrap();

        let by_buyer = Deal::propose(1, "alice".into(), valid, now);
        assert_eq!(by_buyer.flags().bits(), DealFlags::BUYER_ACCEPTED);
        let by_seller = Deal::propose(1, "bob".into(), valid, now);
        assert_eq!(by_seller.flags().bits(), DealFlags::SELLER_ACCEPTED);
        let by_outsider = Deal::propose(1, "dave".into(), valid, now);
        assert_eq!(by_outsider.flags().bits(), 0);
        assert_eq!(by_outsider.state(), DealState::Proposed);
    }

    #[test]
    fn terms_validation() {
        assert_eq!(
            terms().set_description("  ").validate().unwrap_err(),
            ValidationError::EmptyDescription
        );
        assert_eq!(
            terms().set_arbiter("alice".into()).validate().unwrap_err(),
            ValidationError::DuplicateParties
        );
        assert_eq!(
            terms().set_delivery_days(0).validate().unwrap_err(),
            ValidationError::ZeroDays
        );
        assert_eq!(
            DealTerms::new().set_description("x").validate().unwrap_err(),
            ValidationError::MissingField("token_contract")
        );
    }

    #[test]
    fn funding_sets_expiry_from_whole_days() {
        let now = TimeStamp::from_unix(1_700_000_000);
        let mut deal = Deal::propose(1, "alice".into(), terms().validate().unwrap(), now);
        deal.mark_funded(now).unwrap();
        assert_eq!(deal.funded_at(), Some(now));
        assert_eq!(
            deal.expires(),
            Expiry::At(TimeStamp::from_unix(1_700_000_000 + 5 * SECONDS_PER_DAY))
        );

        deal.extend_term(2).unwrap();
        assert_eq!(deal.delivery_days(), 7);
        assert_eq!(
            deal.expires(),
            Expiry::At(TimeStamp::from_unix(1_700_000_000 + 7 * SECONDS_PER_DAY))
        );
        assert_eq!(deal.extend_term(u32::MAX), Err(ValidationError::TermOverflow));
    }

    #[test]
    fn terms_past_the_encodable_range_leave_the_deal_untouched() {
        let now = TimeStamp::from_unix(1_700_000_000);
        for days in [u32::MAX, 200_000] {
            let long = terms().set_delivery_days(days);
            let mut deal = Deal::propose(1, "alice".into(), long.validate().unwrap(), now);
            let before = deal.clone();
            assert_eq!(deal.mark_funded(now), Err(ValidationError::TermOverflow));
            assert_eq!(deal, before);
        }

        let mut deal = Deal::propose(1, "alice".into(), terms().validate().unwrap(), now);
        deal.mark_funded(now).unwrap();
        let funded = deal.clone();
        assert_eq!(deal.extend_term(200_000), Err(ValidationError::TermOverflow));
        assert_eq!(deal, funded);
    }

    #[test]
    fn timestamp_arithmetic_stays_encodable() {
        let now = TimeStamp::from_unix(1_700_000_000);
        assert_eq!(now.checked_plus_days(200_000), None);
        assert_eq!(now.checked_plus_days(u32::MAX), None);
        assert_eq!(now.plus_days(u32::MAX), TimeStamp::latest());
        assert_eq!(now + TimeDelta::days(200_000), TimeStamp::latest());
        assert_eq!(now + TimeDelta::days(-200_000), TimeStamp::earliest());
        assert!(minicbor::to_vec(TimeStamp::latest()).is_ok());

        let mut deal = Deal::propose(1, "alice".into(), terms().validate().unwrap(), TimeStamp::latest());
        assert_eq!(
            deal.advance_expiry(now),
            Err(ValidationError::ExpiryOutOfRange)
        );
    }

    #[test]
    fn expiry_never_moves_backwards() {
        let now = TimeStamp::from_unix(1_700_000_000);
        let mut deal = Deal::propose(1, "alice".into(), terms().validate().unwrap(), now);
        deal.advance_expiry(TimeStamp::from_unix(1_600_000_000)).unwrap();
        assert_eq!(deal.expires(), Expiry::At(TimeStamp::from_unix(1_700_000_001)));
    }

    #[test]
    fn arbitration_lock_pairs_flag_and_sentinel() {
        let now = TimeStamp::from_unix(1_700_000_000);
        let mut deal = Deal::propose(1, "alice".into(), terms().validate().unwrap(), now);
        deal.lock_for_arbitration();
        assert!(deal.in_arbitration());
        assert!(deal.expires().is_locked());
        assert_eq!(deal.expires().index_nanos(), 0);
        assert!(!deal.expires().is_due(now));
    }
}
