use std::{collections::HashSet, sync::Arc, thread};

use chat_broker::broker::{
    error::BrokerErrorKind,
    pool::{CredentialPool, SelectionHint},
    types::{CredentialStatus, DisableReason, Provider},
};

use crate::support::credential;

#[test]
fn given_pool_without_matching_model_when_selecting_then_no_eligible_credential_is_returned() {
    let pool = CredentialPool::from_credentials([credential(
        "c1",
        Provider::OpenAi,
        &["gpt-3.5-turbo"],
    )])
    .expect("pool should seed");

    let err = pool
        .select(Provider::OpenAi, "gpt-4", &SelectionHint::default())
        .expect_err("gpt-4 is not served");
    assert_eq!(err.kind, BrokerErrorKind::NoEligibleCredential);
    assert!(err.is_service_unavailable());
}

#[test]
fn given_disabled_and_excluded_credentials_when_selecting_then_only_eligible_one_is_chosen() {
    let pool = CredentialPool::from_credentials([
        credential("enabled", Provider::OpenAi, &["gpt-4"]),
        credential("excluded", Provider::OpenAi, &["gpt-4"]),
        credential("disabled", Provider::OpenAi, &["gpt-4"])
            .with_status(CredentialStatus::Disabled(DisableReason::Admin)),
        credential("other-provider", Provider::Anthropic, &["gpt-4"]),
    ])
    .expect("pool should seed");

    let hint = SelectionHint::excluding("excluded");
    for _ in 0..50 {
        let chosen = pool
            .select(Provider::OpenAi, "gpt-4", &hint)
            .expect("one credential is eligible");
        assert_eq!(chosen.id, "enabled");
    }
}

#[test]
fn given_several_eligible_credentials_when_selecting_repeatedly_then_each_is_chosen() {
    let pool = CredentialPool::from_credentials(
        ["a", "b", "c"].map(|id| credential(id, Provider::OpenAi, &["gpt-4"])),
    )
    .expect("pool should seed");

    let chosen = (0..300)
        .map(|_| {
            pool.select(Provider::OpenAi, "gpt-4", &SelectionHint::default())
                .expect("credential should be selected")
                .id
                .clone()
        })
        .collect::<HashSet<_>>();
    assert_eq!(chosen.len(), 3, "uniform selection should reach every credential");
}

#[test]
fn given_put_with_same_id_when_selecting_then_replacement_is_visible_and_old_arc_survives() {
    let pool = CredentialPool::from_credentials([credential("c1", Provider::OpenAi, &["gpt-4"])])
        .expect("pool should seed");
    let held = pool
        .select(Provider::OpenAi, "gpt-4", &SelectionHint::default())
        .expect("credential should be selected");

    let mut replacement = credential("c1", Provider::OpenAi, &["gpt-3.5-turbo"]);
    replacement.key = "rotated".to_string();
    pool.put(replacement).expect("put should succeed");

    assert_eq!(held.key, "key-c1", "holder keeps its version");
    assert!(
        pool.select(Provider::OpenAi, "gpt-4", &SelectionHint::default())
            .is_err()
    );
    let current = pool.get("c1").expect("credential should exist");
    assert_eq!(current.key, "rotated");
    assert_eq!(pool.len(Provider::OpenAi), 1);
}

#[test]
fn given_put_with_new_provider_when_reading_then_credential_moves_buckets() {
    let pool = CredentialPool::from_credentials([credential("c1", Provider::OpenAi, &["gpt-4"])])
        .expect("pool should seed");

    pool.put(credential("c1", Provider::Anthropic, &["claude-2"]))
        .expect("put should succeed");

    assert_eq!(pool.len(Provider::OpenAi), 0);
    assert_eq!(pool.len(Provider::Anthropic), 1);
    assert_eq!(
        pool.get("c1").expect("credential should exist").provider,
        Provider::Anthropic
    );
}

#[test]
fn given_invalid_credential_when_put_then_invalid_request_is_returned() {
    let pool = CredentialPool::new();

    let err = pool
        .put(credential("c1", Provider::OpenAi, &[]))
        .expect_err("empty model set is invalid");
    assert_eq!(err.kind, BrokerErrorKind::InvalidRequest);

    let mut no_scheme = credential("c2", Provider::OpenAi, &["gpt-4"]);
    no_scheme.host = "api.openai.com".to_string();
    assert!(pool.put(no_scheme).is_err());
    assert!(pool.is_empty());
}

#[test]
fn given_removed_credential_when_setting_status_then_it_is_not_resurrected() {
    let pool = CredentialPool::from_credentials([credential("c1", Provider::OpenAi, &["gpt-4"])])
        .expect("pool should seed");

    let removed = pool.remove("c1").expect("credential should be removed");
    assert_eq!(removed.id, "c1");
    assert!(
        pool.set_status("c1", CredentialStatus::Disabled(DisableReason::AuthRejected))
            .is_none()
    );
    assert!(pool.get("c1").is_none());
    assert!(pool.remove("c1").is_none());
}

#[test]
fn given_replaced_credential_when_setting_status_conditionally_then_update_is_refused() {
    let pool = CredentialPool::from_credentials([credential("c1", Provider::OpenAi, &["gpt-4"])])
        .expect("pool should seed");
    let read = pool.get("c1").expect("credential should exist");

    pool.put(
        credential("c1", Provider::OpenAi, &["gpt-4"])
            .with_status(CredentialStatus::Disabled(DisableReason::Admin)),
    )
    .expect("put should succeed");

    assert!(pool.set_status_if(&read, CredentialStatus::Enabled).is_none());
    assert_eq!(
        pool.get("c1").expect("credential should exist").status,
        CredentialStatus::Disabled(DisableReason::Admin)
    );

    let current = pool.get("c1").expect("credential should exist");
    let updated = pool
        .set_status_if(&current, CredentialStatus::Enabled)
        .expect("current version may be updated");
    assert_eq!(updated.status, CredentialStatus::Enabled);
}

#[test]
fn given_concurrent_provider_moves_when_putting_then_id_lives_in_one_bucket() {
    let pool = Arc::new(CredentialPool::new());

    let writers = [Provider::OpenAi, Provider::Anthropic].map(|provider| {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            for _ in 0..500 {
                pool.put(credential("c1", provider, &["gpt-4"]))
                    .expect("put should succeed");
            }
        })
    });
    for writer in writers {
        writer.join().expect("writer thread should finish");
    }

    assert_eq!(
        pool.len(Provider::OpenAi) + pool.len(Provider::Anthropic),
        1,
        "one id must never sit in two buckets"
    );
}

#[test]
fn given_concurrent_puts_and_selects_when_running_then_readers_never_see_missing_credential() {
    let pool = Arc::new(
        CredentialPool::from_credentials([credential("c1", Provider::OpenAi, &["gpt-4"])])
            .expect("pool should seed"),
    );

    let writer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            for round in 0..500 {
                let mut next = credential("c1", Provider::OpenAi, &["gpt-4"]);
                next.key = format!("key-{round}");
                pool.put(next).expect("put should succeed");
            }
        })
    };

    for _ in 0..500 {
        let chosen = pool
            .select(Provider::OpenAi, "gpt-4", &SelectionHint::default())
            .expect("replacement must never hide the credential");
        assert_eq!(chosen.id, "c1");
    }
    writer.join().expect("writer thread should finish");
    assert_eq!(pool.len(Provider::OpenAi), 1);
}
