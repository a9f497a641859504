//! Terminal walkthrough of an offline token's whole life.
//!
//! Alice buys tokens from the issuer, pays Bob offline with change made on
//! her phone, a cloned phone tries to spend the same token twice, everyone
//! reconnects and reconciles, and the leftovers expire and get refunded.
//!
//! Run with:
//!   cargo run --example demo --release

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};

use otm_protocol::config::{IssuerConfig, ProtocolConfig};
use otm_protocol::crypto::Keypair;
use otm_protocol::ports::{InMemoryLedger, LoopbackNetwork};
use otm_protocol::storage::TokenDb;
use otm_protocol::token::{DelegatedDivider, TransferRecord};
use otm_protocol::wallet::OfflinePayment;
use otm_protocol::{
    Issuer, IssuerGateway, PaymentExchange, ReconciliationCoordinator, RetryPolicy, WalletCore,
};

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

const BG_BLUE: &str = "\x1b[44m";

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn banner() {
    println!();
    println!("{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}");
    println!("{BG_BLUE}{BOLD}{WHITE}    OFFLINE TOKEN PROTOCOL  --  Lifecycle Demo                      {RESET}");
    println!("{BG_BLUE}{BOLD}{WHITE}    Ed25519 tokens  |  delegated division  |  online settlement     {RESET}");
    println!("{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}");
    println!();
}

fn section(num: u32, title: &str) {
    println!();
    println!("{BOLD}{CYAN}===[{YELLOW} Step {num} {CYAN}]=============================================================={RESET}");
    println!("{BOLD}{WHITE}  {title}{RESET}");
    println!("{CYAN}------------------------------------------------------------------------{RESET}");
}

fn subsection(text: &str) {
    println!("{DIM}{CYAN}  >> {text}{RESET}");
}

fn success(text: &str) {
    println!("{GREEN}  [OK] {text}{RESET}");
}

fn alarm(text: &str) {
    println!("{RED}{BOLD}  [!!] {text}{RESET}");
}

fn info(label: &str, value: &str) {
    println!("{WHITE}  {BOLD}{label}:{RESET} {YELLOW}{value}{RESET}");
}

fn timing(label: &str, elapsed: std::time::Duration) {
    let ms = elapsed.as_secs_f64() * 1000.0;
    println!("{DIM}{MAGENTA}  [{label}: {ms:.2} ms]{RESET}");
}

fn money(minor: u64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}

fn wallet_row(name: &str, wallet: &WalletCore, color: &str) {
    let b = wallet.balance(Utc::now());
    println!(
        "  {color}{BOLD}{name:<8}{RESET}  spendable {WHITE}{:>8}{RESET}  reserved {DIM}{:>7}{RESET}  received {DIM}{:>7}{RESET}  quarantined {DIM}{:>7}{RESET}",
        money(b.spendable),
        money(b.reserved),
        money(b.received),
        money(b.quarantined),
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let demo_start = Instant::now();
    banner();

    let config = ProtocolConfig::default();

    // -----------------------------------------------------------------------
    // Step 1: Issuer
    // -----------------------------------------------------------------------

    section(1, "Issuer bootstrap");
    subsection("Generating the issuer key and opening a temporary token store...");

    let ledger = Arc::new(InMemoryLedger::new());
    let store = Arc::new(TokenDb::open_temporary()?);
    let issuer = Arc::new(Issuer::restore(
        Keypair::generate(),
        IssuerConfig {
            denominations: vec![5_000, 2_000, 1_000],
            ..config.issuer.clone()
        },
        ledger.clone(),
        store.clone(),
    )?);
    info("Issuer key", &issuer.public_key().short());
    info("Denominations", "50.00 / 20.00 / 10.00");

    // -----------------------------------------------------------------------
    // Step 2: Buying tokens
    // -----------------------------------------------------------------------

    section(2, "Alice buys 80.00 of offline money");

    let alice = Arc::new(WalletCore::new(
        Keypair::generate(),
        issuer.public_key(),
        &config.wallet,
    ));
    let bob = Arc::new(WalletCore::new(
        Keypair::generate(),
        issuer.public_key(),
        &config.wallet,
    ));

    let t = Instant::now();
    let tokens = issuer.issue_tokens(alice.public_key(), 8_000, 8_000, Utc::now())?;
    timing("mint", t.elapsed());
    for token in &tokens {
        info("  token", &format!("{}  {}", token.id.short(), money(token.amount)));
    }
    alice.deposit_issued(tokens, Utc::now())?;

    subsection("Certifying a division key on Alice's phone...");
    let delegate = Keypair::generate();
    let cert = issuer.delegate_division(
        alice.public_key(),
        delegate.public_key(),
        Utc::now() + Duration::days(60),
        Utc::now(),
    )?;
    alice.install_divider(DelegatedDivider::new(delegate, cert)?)?;
    success("Alice can now make change offline");
    wallet_row("Alice", &alice, BLUE);

    // -----------------------------------------------------------------------
    // Step 3: Offline payment
    // -----------------------------------------------------------------------

    section(3, "Offline: Alice pays Bob 13.50");
    subsection("No network. Phones talk over a short-range link...");

    let net = LoopbackNetwork::new();
    let alice_link = PaymentExchange::new(
        alice.clone(),
        Arc::new(net.endpoint(alice.public_key())),
        &config.wallet,
    );
    let bob_link = PaymentExchange::new(
        bob.clone(),
        Arc::new(net.endpoint(bob.public_key())),
        &config.wallet,
    );
    alice_link.attach();
    bob_link.attach();

    let t = Instant::now();
    let record = alice_link
        .send_payment(bob.public_key(), 1_350, Utc::now())
        .await?;
    timing("divide + sign + verify + ack", t.elapsed());
    info("Transfer", &record.id.to_string());
    info("Tokens moved", &record.token_ids.len().to_string());
    success("Bob verified every token offline and acknowledged");
    wallet_row("Alice", &alice, BLUE);
    wallet_row("Bob", &bob, GREEN);

    // -----------------------------------------------------------------------
    // Step 4: A cloned phone
    // -----------------------------------------------------------------------

    section(4, "A cloned phone double-spends");
    subsection("Mallory hands the same token to Bob and then to Carol, both offline...");

    let carol = Arc::new(WalletCore::new(
        Keypair::generate(),
        issuer.public_key(),
        &config.wallet,
    ));
    let mallory_keys = Keypair::generate();
    let twice = issuer
        .issue_tokens(mallory_keys.public_key(), 1_000, 1_000, Utc::now())?
        .remove(0);
    for payee in [&bob, &carol] {
        let now = Utc::now();
        let record =
            TransferRecord::create(&mallory_keys, payee.public_key(), &[twice.clone()], now)?;
        let payment = OfflinePayment {
            record,
            tokens: vec![twice.clone()],
            provenance: vec![],
        };
        payee.receive_payment(&payment, &mallory_keys.public_key(), now)?;
    }
    alarm("Two wallets now hold the same 10.00 token. Offline, nobody can tell.");

    // -----------------------------------------------------------------------
    // Step 5: Reconciliation
    // -----------------------------------------------------------------------

    section(5, "Back online: reconcile");

    let gateway: Arc<dyn IssuerGateway> = issuer.clone();
    let retry = RetryPolicy::from(&config.retry);
    for (name, wallet, color) in [
        ("Alice", &alice, BLUE),
        ("Bob", &bob, GREEN),
        ("Carol", &carol, MAGENTA),
    ] {
        let coordinator = ReconciliationCoordinator::new(wallet.clone(), gateway.clone(), retry);
        let report = coordinator.reconcile(Utc::now()).await?;
        println!(
            "  {color}{BOLD}{name:<8}{RESET}  synced {}  redeemed {WHITE}{}{RESET}  quarantined {}",
            report.synced,
            money(report.redeemed_total),
            report.quarantined.len()
        );
    }
    info("Bob's ledger account", &money(ledger.balance_of(&bob.public_key())));
    info(
        "Carol's ledger account",
        &money(ledger.balance_of(&carol.public_key())),
    );
    alarm("Carol redeemed second: her copy was refused and quarantined");
    wallet_row("Carol", &carol, MAGENTA);

    // -----------------------------------------------------------------------
    // Step 6: Expiry
    // -----------------------------------------------------------------------

    section(6, "Thirty-one days later");
    subsection("The expiry sweep refunds every unredeemed remainder to its purchaser...");

    let later = Utc::now() + Duration::days(31);
    let batch = issuer.handle_expired_tokens(later).await;
    info("Roots refunded", &batch.refunds.len().to_string());
    info("Total refunded", &money(batch.total_refunded));
    info("Alice's ledger account", &money(ledger.balance_of(&alice.public_key())));
    let again = issuer.handle_expired_tokens(later).await;
    success(&format!(
        "Second sweep refunded {} (a root is refunded at most once)",
        money(again.total_refunded)
    ));

    let stats = issuer.stats();
    println!();
    info("Outstanding value", &money(stats.outstanding_value));
    info("Redeemed value", &money(stats.redeemed_value));
    info("Refunded value", &money(stats.refunded_value));
    info("Tokens persisted", &store.token_count().to_string());
    timing("whole demo", demo_start.elapsed());
    println!();
    Ok(())
}
