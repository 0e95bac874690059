use escrow_deals::asset::{Quantity, Symbol};
use escrow_deals::deal::{DealTerms, PartyId, TimeStamp};
use escrow_deals::ledger::InMemoryLedger;
use escrow_deals::{EscrowConfig, EscrowService, Invocation, TokenTransfer};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let temp_dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("escrow.db"))?);

    let custodian = PartyId::new("escrow");
    let token = PartyId::new("eosio.token");
    let (buyer, seller, arbiter) = (PartyId::new("alice"), PartyId::new("bob"), PartyId::new("carol"));
    let eos = Symbol::new("EOS", 4);

    let ledger = Arc::new(InMemoryLedger::new());
    for account in [&custodian, &token, &buyer, &seller, &arbiter] {
        ledger.add_account(account.clone());
    }
    ledger.add_balance_row(buyer.clone(), token.clone(), eos.clone());

    let service = EscrowService::new(db, EscrowConfig::new(custodian.clone()), ledger.clone())?;
    let price: Quantity = "25.0000 EOS".parse()?;
    let terms = DealTerms::new()
        .set_description("Vintage road bicycle")
        .set_token_contract(token.clone())
        .set_quantity(price.clone())
        .set_buyer(buyer.clone())
        .set_seller(seller.clone())
        .set_arbiter(arbiter.clone())
        .set_delivery_days(5);

    let mut now = TimeStamp::new();
    let fund = |id: u64| TokenTransfer {
        contract: token.clone(),
        from: buyer.clone(),
        to: custodian.clone(),
        quantity: price.clone(),
        memo: id.to_string(),
    };

    // happy path: propose, accept, fund, deliver, confirm
    let receipt = service.new_deal(&Invocation::unique(buyer.clone(), now)?, &buyer, &terms)?;
    let happy = receipt.deal().map(|d| d.id()).unwrap_or_default();
    service.accept(&Invocation::unique(seller.clone(), now)?, &seller, happy)?;
    service.on_transfer(&Invocation::unique(buyer.clone(), now)?, &fund(happy))?;
    service.delivered(&Invocation::unique(seller.clone(), now)?, happy)?;
    service.goods_received(&Invocation::unique(buyer.clone(), now)?, happy)?;
    println!("deal {happy} closed");

    // dispute: delivered but never confirmed, so it expires into arbitration
    let receipt = service.new_deal(&Invocation::unique(buyer.clone(), now)?, &buyer, &terms)?;
    let disputed = receipt.deal().map(|d| d.id()).unwrap_or_default();
    service.accept(&Invocation::unique(seller.clone(), now)?, &seller, disputed)?;
    service.on_transfer(&Invocation::unique(buyer.clone(), now)?, &fund(disputed))?;
    service.delivered(&Invocation::unique(seller.clone(), now)?, disputed)?;

    now = now.plus_days(4);
    service.sweep(&Invocation::unique(arbiter.clone(), now)?)?;
    if let Some(deal) = service.deal(disputed)? {
        println!("deal {disputed} is now {:?}", deal.state());
    }
    service.arb_enforce(&Invocation::unique(arbiter.clone(), now)?, disputed)?;

    let report = service.dispatch(&*ledger, &*ledger)?;
    println!("dispatched {} effects", report.delivered);
    for transfer in ledger.transfers() {
        println!("{} -> {}: {} ({})", transfer.from, transfer.to, transfer.asset, transfer.memo);
    }
    println!("{seller} received {} in total", Quantity::new(ledger.received_by(&seller), eos));

    Ok(())
}
