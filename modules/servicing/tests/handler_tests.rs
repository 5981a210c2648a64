//! Integration tests for the projection handlers
//!
//! Events are fed through the parser and the default registry against the
//! in-memory store, and the tests assert on the projected documents.

mod common;

use common::{apply_event, find_by};
use projection_store::MemoryProjectionStore;
use serde_json::{json, Map, Value};

fn strip_timestamps(doc: &Map<String, Value>) -> Map<String, Value> {
    let mut doc = doc.clone();
    doc.remove("createdAt");
    doc.remove("updatedAt");
    doc.remove("_id");
    doc
}

// ---------------------------------------------------------------------------
// Customer handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn customer_changed_creates_new_customer() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "customer.changed.v1",
            "cid": "conv-123",
            "usr": "CUS-TEST-001",
            "seq": 1,
            "dat": {
                "customer_id": "CUS-TEST-001",
                "first_name": "John",
                "last_name": "Smith",
                "email_address": "john@test.com",
                "mobile_phone_number": "0412345678",
                "date_of_birth": "1985-06-15",
                "ekyc_status": "successful",
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "customers", "customerId", "CUS-TEST-001")
        .await
        .unwrap();
    assert_eq!(doc["customerId"], json!("CUS-TEST-001"));
    assert_eq!(doc["firstName"], json!("John"));
    assert_eq!(doc["lastName"], json!("Smith"));
    assert_eq!(doc["fullName"], json!("John Smith"));
    assert_eq!(doc["emailAddress"], json!("john@test.com"));
    assert_eq!(doc["ekycStatus"], json!("successful"));
    assert!(doc.contains_key("createdAt"));
    assert!(doc.contains_key("updatedAt"));
}

#[tokio::test]
async fn customer_changed_stores_residential_address() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "customer.changed.v1",
            "dat": {
                "customer_id": "CUS-TEST-002",
                "first_name": "Jane",
                "last_name": "Doe",
                "residential_address": {
                    "address_type": "RESIDENTIAL",
                    "street_number": "123",
                    "street_name": "Test",
                    "street_type": "St",
                    "suburb": "Sydney",
                    "state": "NSW",
                    "postcode": "2000",
                    "country": "Australia",
                    "full_address": "123 Test St, Sydney NSW 2000",
                },
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "customers", "customerId", "CUS-TEST-002")
        .await
        .unwrap();
    let addr = &doc["residentialAddress"];
    assert_eq!(addr["streetNumber"], json!("123"));
    assert_eq!(addr["streetName"], json!("Test"));
    assert_eq!(addr["suburb"], json!("Sydney"));
    assert_eq!(addr["state"], json!("NSW"));
    assert_eq!(addr["fullAddress"], json!("123 Test St, Sydney NSW 2000"));
    // Derived back-compat fields
    assert_eq!(addr["street"], json!("123 Test St"));
    assert_eq!(addr["city"], json!("Sydney"));
}

#[tokio::test]
async fn customer_partial_update_preserves_prior_fields() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "customer.created.v1",
            "dat": {"customer_id": "CUS1", "first_name": "John", "last_name": "Smith"},
        }),
    )
    .await
    .unwrap();

    // Email-only delta must not lose the name
    apply_event(
        &store,
        json!({
            "typ": "customer.updated.v1",
            "dat": {"customer_id": "CUS1", "email_address": "new@test.com"},
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "customers", "customerId", "CUS1")
        .await
        .unwrap();
    assert_eq!(doc["firstName"], json!("John"));
    assert_eq!(doc["lastName"], json!("Smith"));
    assert_eq!(doc["fullName"], json!("John Smith"));
    assert_eq!(doc["emailAddress"], json!("new@test.com"));
}

#[tokio::test]
async fn customer_verified_sets_flag_only() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "customer.created.v1",
            "dat": {"customer_id": "CUS-TEST-003", "first_name": "Kim", "ekyc_status": "pending"},
        }),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "customer.verified.v1",
            "dat": {"customer_id": "CUS-TEST-003"},
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "customers", "customerId", "CUS-TEST-003")
        .await
        .unwrap();
    assert_eq!(doc["identityVerified"], json!(true));
    assert_eq!(doc["ekycStatus"], json!("successful"));
    assert_eq!(doc["firstName"], json!("Kim"));
}

// ---------------------------------------------------------------------------
// Account handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn account_created_builds_projection() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "customer.changed.v1",
            "dat": {"customer_id": "CUS1", "first_name": "John", "last_name": "Smith"},
        }),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "account.created.v1",
            "dat": {
                "account_id": "ACC1",
                "account_number": "ACC-12345",
                "customer_id": "CUS1",
                "status": "ACTIVE",
                "loan_amount": "500.00",
                "loan_fee": "80.00",
                "loan_total_payable": "580.00",
                "current_balance": "580.00",
                "opened_date": "2024-01-15",
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC1")
        .await
        .unwrap();
    assert_eq!(doc["accountNumber"], json!("ACC-12345"));
    assert_eq!(doc["customerIdString"], json!("CUS1"));
    assert_eq!(doc["customerName"], json!("John Smith"));
    assert!(!doc["customerId"].is_null(), "customer reference resolved");
    assert_eq!(doc["loanTerms"]["loanAmount"], json!(500.0));
    assert_eq!(doc["loanTerms"]["loanFee"], json!(80.0));
    assert_eq!(doc["loanTerms"]["totalPayable"], json!(580.0));
    assert_eq!(doc["loanTerms"]["openedDate"], json!("2024-01-15"));
    assert_eq!(doc["balances"]["currentBalance"], json!(580.0));
    assert_eq!(doc["balances"]["totalOutstanding"], json!(580.0));
    assert_eq!(doc["balances"]["totalPaid"], json!(0.0));
    assert_eq!(doc["accountStatus"], json!("active"));
    assert_eq!(doc["sdkStatus"], json!("ACTIVE"));
}

#[tokio::test]
async fn account_created_without_projected_customer() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "account.created.v1",
            "dat": {"account_id": "ACC2", "customer_id": "CUS-UNKNOWN", "status": "PENDING"},
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC2")
        .await
        .unwrap();
    assert!(doc["customerId"].is_null());
    assert_eq!(doc["customerName"], json!(""));
    assert_eq!(doc["accountStatus"], json!("active"));
}

#[tokio::test]
async fn account_created_twice_is_idempotent() {
    let store = MemoryProjectionStore::new();
    let event = json!({
        "typ": "account.created.v1",
        "dat": {
            "account_id": "ACC3",
            "customer_id": "CUS1",
            "status": "ACTIVE",
            "loan_amount": "500.00",
            "current_balance": "580.00",
        },
    });

    apply_event(&store, event.clone()).await.unwrap();
    let first = find_by(&store, "loan-accounts", "loanAccountId", "ACC3")
        .await
        .unwrap();

    apply_event(&store, event).await.unwrap();
    let second = find_by(&store, "loan-accounts", "loanAccountId", "ACC3")
        .await
        .unwrap();

    assert_eq!(strip_timestamps(&first), strip_timestamps(&second));
    assert_eq!(first["createdAt"], second["createdAt"]);
}

#[tokio::test]
async fn account_status_mapping_covers_all_sdk_statuses() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "account.created.v1",
            "dat": {"account_id": "ACC4", "customer_id": "CUS1", "status": "PENDING"},
        }),
    )
    .await
    .unwrap();

    for (sdk_status, expected) in [
        ("PENDING", "active"),
        ("ACTIVE", "active"),
        ("SUSPENDED", "in_arrears"),
        ("CLOSED", "paid_off"),
        ("BRAND_NEW_STATUS", "active"),
    ] {
        apply_event(
            &store,
            json!({
                "typ": "account.status_changed.v1",
                "dat": {"account_id": "ACC4", "new_status": sdk_status},
            }),
        )
        .await
        .unwrap();

        let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC4")
            .await
            .unwrap();
        assert_eq!(doc["accountStatus"], json!(expected), "for {sdk_status}");
        assert_eq!(doc["sdkStatus"], json!(sdk_status));
    }
}

#[tokio::test]
async fn account_status_strips_enum_prefix() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "account.created.v1",
            "dat": {"account_id": "ACC5", "customer_id": "CUS1", "status": "AccountStatus.SUSPENDED"},
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC5")
        .await
        .unwrap();
    assert_eq!(doc["sdkStatus"], json!("SUSPENDED"));
    assert_eq!(doc["accountStatus"], json!("in_arrears"));
}

#[tokio::test]
async fn account_updated_syncs_balances_and_last_payment() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "account.created.v1",
            "dat": {"account_id": "ACC6", "customer_id": "CUS1", "status": "ACTIVE", "current_balance": "580.00"},
        }),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "account.updated.v1",
            "dat": {
                "account_id": "ACC6",
                "current_balance": "435.00",
                "status": "SUSPENDED",
                "last_payment_date": "2024-01-22",
                "last_payment_amount": "145.00",
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC6")
        .await
        .unwrap();
    assert_eq!(doc["balances"]["currentBalance"], json!(435.0));
    assert_eq!(doc["balances"]["totalOutstanding"], json!(435.0));
    assert_eq!(doc["accountStatus"], json!("in_arrears"));
    assert_eq!(doc["lastPayment"]["date"], json!("2024-01-22"));
    assert_eq!(doc["lastPayment"]["amount"], json!(145.0));
}

// ---------------------------------------------------------------------------
// Repayment schedule handlers
// ---------------------------------------------------------------------------

fn schedule_created_event(account_id: &str) -> Value {
    json!({
        "typ": "account.schedule.created.v1",
        "dat": {
            "account_id": account_id,
            "schedule_id": "SCHED-001",
            "n_payments": 4,
            "payment_frequency": "fortnightly",
            "payments": [
                {"payment_number": 1, "due_date": "2024-01-22", "amount": "145.00"},
                {"payment_number": 2, "due_date": "2024-02-05", "amount": "145.00"},
                {"payment_number": 3, "due_date": "2024-02-19", "amount": "145.00"},
                {"payment_number": 4, "due_date": "2024-03-04", "amount": "145.00"},
            ],
            "created_date": "2024-01-15",
        },
    })
}

async fn seed_account(store: &MemoryProjectionStore, account_id: &str) {
    apply_event(
        store,
        json!({
            "typ": "account.created.v1",
            "dat": {"account_id": account_id, "customer_id": "CUS1", "status": "ACTIVE"},
        }),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn schedule_created_writes_all_payments_scheduled() {
    let store = MemoryProjectionStore::new();
    seed_account(&store, "ACC1").await;

    apply_event(&store, schedule_created_event("ACC1")).await.unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC1")
        .await
        .unwrap();
    let schedule = &doc["repaymentSchedule"];
    assert_eq!(schedule["scheduleId"], json!("SCHED-001"));
    assert_eq!(schedule["numberOfPayments"], json!(4));
    assert_eq!(schedule["paymentFrequency"], json!("fortnightly"));
    assert_eq!(schedule["createdDate"], json!("2024-01-15"));

    let payments = schedule["payments"].as_array().unwrap();
    assert_eq!(payments.len(), 4);
    for (i, payment) in payments.iter().enumerate() {
        assert_eq!(payment["paymentNumber"], json!(i as i64 + 1));
        assert_eq!(payment["status"], json!("scheduled"));
        assert_eq!(payment["amount"], json!(145.0));
    }
}

#[tokio::test]
async fn schedule_updated_marks_payment_paid() {
    let store = MemoryProjectionStore::new();
    seed_account(&store, "ACC1").await;
    apply_event(&store, schedule_created_event("ACC1")).await.unwrap();

    apply_event(
        &store,
        json!({
            "typ": "account.schedule.updated.v1",
            "dat": {
                "account_id": "ACC1",
                "schedule_id": "SCHED-001",
                "payments": [{
                    "payment_number": 1,
                    "status": "PAID",
                    "paid_date": "2024-01-22",
                    "amount_paid": "145.00",
                    "amount_remaining": "0.00",
                    "linked_transaction_ids": ["TXN-1"],
                }],
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC1")
        .await
        .unwrap();
    let payments = doc["repaymentSchedule"]["payments"].as_array().unwrap();
    assert_eq!(payments.len(), 4, "no placeholder added for a matched payment");
    // Status normalised to lowercase
    assert_eq!(payments[0]["status"], json!("paid"));
    assert_eq!(payments[0]["paidDate"], json!("2024-01-22"));
    assert_eq!(payments[0]["amountPaid"], json!(145.0));
    assert_eq!(payments[0]["amountRemaining"], json!(0.0));
    assert_eq!(payments[0]["linkedTransactionIds"], json!(["TXN-1"]));
    assert_eq!(payments[1]["status"], json!("scheduled"));
}

#[tokio::test]
async fn schedule_updated_before_created_builds_placeholder() {
    let store = MemoryProjectionStore::new();

    // schedule.updated arrives with no account or schedule projected yet
    apply_event(
        &store,
        json!({
            "typ": "account.schedule.updated.v1",
            "dat": {
                "account_id": "ACC1",
                "schedule_id": "SCHED-001",
                "payments": [{
                    "payment_number": 1,
                    "status": "paid",
                    "paid_date": "2024-01-22",
                    "amount_paid": "145.00",
                }],
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC1")
        .await
        .unwrap();
    assert_eq!(doc["repaymentSchedule"]["scheduleId"], json!("SCHED-001"));
    let payments = doc["repaymentSchedule"]["payments"].as_array().unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0]["paymentNumber"], json!(1));
    assert_eq!(payments[0]["status"], json!("paid"));
    assert_eq!(payments[0]["dueDate"], json!(null));
    assert_eq!(payments[0]["amount"], json!(null));
    assert_eq!(payments[0]["paidDate"], json!("2024-01-22"));
    assert_eq!(payments[0]["amountPaid"], json!(145.0));
}

#[tokio::test]
async fn schedule_created_enriches_placeholder_and_keeps_status() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "account.schedule.updated.v1",
            "dat": {
                "account_id": "ACC1",
                "schedule_id": "SCHED-001",
                "payments": [{
                    "payment_number": 1,
                    "status": "paid",
                    "paid_date": "2024-01-22",
                    "amount_paid": "145.00",
                }],
            },
        }),
    )
    .await
    .unwrap();

    apply_event(&store, schedule_created_event("ACC1")).await.unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC1")
        .await
        .unwrap();
    let payments = doc["repaymentSchedule"]["payments"].as_array().unwrap();
    assert_eq!(payments.len(), 4);

    // Payment 1: enriched with dueDate/amount, recorded status preserved
    assert_eq!(payments[0]["paymentNumber"], json!(1));
    assert_eq!(payments[0]["status"], json!("paid"));
    assert_eq!(payments[0]["dueDate"], json!("2024-01-22"));
    assert_eq!(payments[0]["amount"], json!(145.0));
    assert_eq!(payments[0]["paidDate"], json!("2024-01-22"));
    assert_eq!(payments[0]["amountPaid"], json!(145.0));

    // Payments 2-4 are fresh
    for payment in &payments[1..] {
        assert_eq!(payment["status"], json!("scheduled"));
    }

    // paymentNumber unique within the schedule
    let mut numbers: Vec<i64> = payments
        .iter()
        .map(|p| p["paymentNumber"].as_i64().unwrap())
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    assert_eq!(numbers.len(), 4);
}

#[tokio::test]
async fn schedule_created_replay_never_downgrades_status() {
    let store = MemoryProjectionStore::new();
    seed_account(&store, "ACC1").await;
    apply_event(&store, schedule_created_event("ACC1")).await.unwrap();

    apply_event(
        &store,
        json!({
            "typ": "account.schedule.updated.v1",
            "dat": {
                "account_id": "ACC1",
                "payments": [{"payment_number": 2, "status": "missed"}],
            },
        }),
    )
    .await
    .unwrap();

    // A replayed schedule.created must not reset payment 2 to scheduled
    apply_event(&store, schedule_created_event("ACC1")).await.unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC1")
        .await
        .unwrap();
    let payments = doc["repaymentSchedule"]["payments"].as_array().unwrap();
    assert_eq!(payments[1]["status"], json!("missed"));
    assert_eq!(payments[0]["status"], json!("scheduled"));
}

#[tokio::test]
async fn schedule_updated_with_no_payments_is_a_no_op() {
    let store = MemoryProjectionStore::new();
    seed_account(&store, "ACC1").await;

    apply_event(
        &store,
        json!({
            "typ": "account.schedule.updated.v1",
            "dat": {"account_id": "ACC1", "schedule_id": "SCHED-001", "payments": []},
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "loan-accounts", "loanAccountId", "ACC1")
        .await
        .unwrap();
    assert!(!doc.contains_key("repaymentSchedule"));
}

// ---------------------------------------------------------------------------
// Conversation handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conversation_started_creates_projection() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "conversation_started",
            "cid": "CONV-TEST-001",
            "usr": "CUS-TEST-001",
            "app_number": "APP-12345",
            "timestamp": "2024-01-15T10:00:00Z",
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "CONV-TEST-001")
        .await
        .unwrap();
    assert_eq!(doc["customerIdString"], json!("CUS-TEST-001"));
    assert_eq!(doc["applicationNumber"], json!("APP-12345"));
    assert_eq!(doc["status"], json!("active"));
    assert_eq!(doc["startedAt"], json!("2024-01-15T10:00:00Z"));
    assert_eq!(doc["utterances"], json!([]));
    assert_eq!(doc["assessments"], json!({}));
    assert_eq!(doc["noticeboard"], json!([]));
    assert_eq!(doc["version"], json!(1));
}

#[tokio::test]
async fn user_input_appends_customer_utterance() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "user_input",
            "cid": "C1",
            "usr": "CUS1",
            "payload": {
                "utterance": "I need a loan of $500",
                "created_at": "2024-01-15T10:01:00Z",
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    let utterances = doc["utterances"].as_array().unwrap();
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0]["username"], json!("customer"));
    assert_eq!(utterances[0]["utterance"], json!("I need a loan of $500"));
    assert_eq!(doc["lastUtteranceTime"], json!("2024-01-15T10:01:00Z"));
    assert_eq!(doc["version"], json!(2));
}

#[tokio::test]
async fn assistant_response_appends_with_rationale() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "assistant_response",
            "cid": "C1",
            "payload": {
                "utterance": "I can help you with that.",
                "rationale": "Customer requested loan",
                "created_at": "2024-01-15T10:02:00Z",
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    let utterances = doc["utterances"].as_array().unwrap();
    assert_eq!(utterances[0]["username"], json!("assistant"));
    assert_eq!(utterances[0]["rationale"], json!("Customer requested loan"));
}

#[tokio::test]
async fn utterance_creates_stub_when_conversation_missing() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({
            "typ": "user_input",
            "cid": "C-ORPHAN",
            "usr": "CUS1",
            "payload": {"utterance": "hello?"},
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C-ORPHAN")
        .await
        .unwrap();
    assert_eq!(doc["status"], json!("active"));
    assert_eq!(doc["customerIdString"], json!("CUS1"));
    assert_eq!(doc["utterances"].as_array().unwrap().len(), 1);
    // Stub starts at 1, the utterance bumps it
    assert_eq!(doc["version"], json!(2));
}

#[tokio::test]
async fn final_decision_maps_status() {
    for (decision, expected) in [
        ("APPROVED", "approved"),
        ("DECLINED", "declined"),
        ("REFERRED", "referred"),
        ("TIMEOUT", "hard_end"),
    ] {
        let store = MemoryProjectionStore::new();
        apply_event(
            &store,
            json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
        )
        .await
        .unwrap();

        apply_event(
            &store,
            json!({"typ": "final_decision", "cid": "C1", "decision": decision}),
        )
        .await
        .unwrap();

        let doc = find_by(&store, "conversations", "conversationId", "C1")
            .await
            .unwrap();
        assert_eq!(doc["status"], json!(expected), "for {decision}");
        assert_eq!(doc["finalDecision"], json!(decision));
    }
}

#[tokio::test]
async fn final_decision_reads_outcome_when_decision_absent() {
    let store = MemoryProjectionStore::new();
    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({"typ": "final_decision", "cid": "C1", "outcome": "declined"}),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    assert_eq!(doc["status"], json!("declined"));
    assert_eq!(doc["finalDecision"], json!("DECLINED"));
}

#[tokio::test]
async fn assessments_stored_under_their_keys() {
    let store = MemoryProjectionStore::new();
    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "identityRisk_assessment",
            "cid": "C1",
            "payload": {"score": 85, "status": "low_risk"},
        }),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "serviceability_assessment_results",
            "cid": "C1",
            "payload": {"result": "pass", "affordability": true},
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    assert_eq!(doc["assessments"]["identityRisk"]["score"], json!(85));
    assert_eq!(doc["assessments"]["serviceability"]["result"], json!("pass"));
    assert_eq!(doc["version"], json!(3));
}

#[tokio::test]
async fn noticeboard_entry_extracts_topic() {
    let store = MemoryProjectionStore::new();
    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "noticeboard_updated",
            "cid": "C1",
            "agentName": "serviceability_agent::Serviceability Assessment",
            "content": "Customer income verified at $50,000 p.a.",
            "timestamp": "2024-01-15T10:05:00Z",
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    let board = doc["noticeboard"].as_array().unwrap();
    assert_eq!(board.len(), 1);
    assert_eq!(
        board[0]["agentName"],
        json!("serviceability_agent::Serviceability Assessment")
    );
    assert_eq!(board[0]["topic"], json!("Serviceability Assessment"));
    assert_eq!(board[0]["timestamp"], json!("2024-01-15T10:05:00Z"));
}

#[tokio::test]
async fn conversation_summary_stores_purpose_and_facts() {
    let store = MemoryProjectionStore::new();
    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "conversation_summary",
            "cid": "C1",
            "payload": {
                "purpose": "Loan application",
                "facts": ["Customer requested $500", "Income verified"],
            },
        }),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    assert_eq!(doc["purpose"], json!("Loan application"));
    let facts = doc["facts"].as_array().unwrap();
    assert_eq!(facts.len(), 2);
    assert_eq!(facts[0], json!({"fact": "Customer requested $500"}));
}

#[tokio::test]
async fn application_detail_syncs_customer_and_blob() {
    let store = MemoryProjectionStore::new();
    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();

    apply_event(
        &store,
        json!({
            "typ": "applicationDetail_changed",
            "cid": "C1",
            "application_number": "APP-777",
            "loan_purpose": "car repairs",
            "timestamp": "2024-01-15T10:06:00Z",
            "agt": "application_agent",
            "customer": {
                "customer_id": "CUS1",
                "first_name": "John",
                "last_name": "Smith",
            },
        }),
    )
    .await
    .unwrap();

    let conversation = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    assert_eq!(conversation["applicationNumber"], json!("APP-777"));
    let blob = conversation["applicationData"].as_object().unwrap();
    assert_eq!(blob["loan_purpose"], json!("car repairs"));
    assert_eq!(blob["application_number"], json!("APP-777"));
    // Denylisted keys stay out of the blob
    for key in ["typ", "agt", "timestamp", "customer"] {
        assert!(!blob.contains_key(key), "{key} must not be copied");
    }
    assert_eq!(conversation["version"], json!(2));

    let customer = find_by(&store, "customers", "customerId", "CUS1")
        .await
        .unwrap();
    assert_eq!(customer["fullName"], json!("John Smith"));
}

#[tokio::test]
async fn conversation_lifecycle_accumulates_version() {
    let store = MemoryProjectionStore::new();

    apply_event(
        &store,
        json!({"typ": "conversation_started", "cid": "C1", "usr": "CUS1"}),
    )
    .await
    .unwrap();
    apply_event(
        &store,
        json!({"typ": "user_input", "cid": "C1", "payload": {"utterance": "hi"}}),
    )
    .await
    .unwrap();
    apply_event(
        &store,
        json!({
            "typ": "assistant_response",
            "cid": "C1",
            "payload": {"utterance": "hello", "rationale": "greet"},
        }),
    )
    .await
    .unwrap();
    apply_event(
        &store,
        json!({"typ": "final_decision", "cid": "C1", "decision": "APPROVED"}),
    )
    .await
    .unwrap();

    let doc = find_by(&store, "conversations", "conversationId", "C1")
        .await
        .unwrap();
    assert_eq!(doc["status"], json!("approved"));
    assert_eq!(doc["finalDecision"], json!("APPROVED"));
    assert_eq!(doc["utterances"].as_array().unwrap().len(), 2);
    assert!(doc["version"].as_i64().unwrap() >= 4);
}
