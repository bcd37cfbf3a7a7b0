//! A permit-aware worker.
//!
//! Probes its inherited RPC handles (exiting 254 if they are missing, as
//! the invocation contract requires), requests permits from the broker,
//! then watches for quota-update events and returns permits when told to.

#[cfg(unix)]
#[tokio::main]
async fn main() {
    use std::time::Duration;

    use procbus_child::ChildEndpoint;
    use procbus_wire::rpc::{self, method, PermitParams, QuotaUpdate};
    use procbus_wire::{MessageKind, BROKER_TARGET};

    let mut endpoint = ChildEndpoint::inherit_or_exit("permit-worker");

    let request = match rpc::call(
        method::REQUEST_PERMITS,
        PermitParams {
            provider_id: endpoint.id().to_string(),
            permit_count: 4,
        },
    ) {
        Ok(payload) => payload,
        Err(err) => {
            eprintln!("permit-worker: {err}");
            return;
        }
    };

    match endpoint
        .request(BROKER_TARGET, request, Duration::from_secs(5))
        .await
    {
        Ok(response) => eprintln!("permit-worker: granted {}", response.payload["granted"]),
        Err(err) => {
            eprintln!("permit-worker: permit request failed: {err}");
            return;
        }
    }

    // Return whatever the broker claws back.
    while let Ok(Some(msg)) = endpoint.recv().await {
        if msg.kind != MessageKind::Event
            || rpc::method_of(&msg.payload) != Some(method::ON_QUOTA_UPDATE)
        {
            continue;
        }
        let Ok(update) = serde_json::from_value::<QuotaUpdate>(msg.payload.clone()) else {
            continue;
        };
        if update.revoked_permits == 0 {
            continue;
        }
        eprintln!(
            "permit-worker: {} permits revoked ({})",
            update.revoked_permits, update.reason
        );
        let release = match rpc::call(
            method::RELEASE_PERMITS,
            PermitParams {
                provider_id: endpoint.id().to_string(),
                permit_count: update.revoked_permits,
            },
        ) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        if let Err(err) = endpoint
            .request(BROKER_TARGET, release, Duration::from_secs(5))
            .await
        {
            eprintln!("permit-worker: release failed: {err}");
        }
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("permit_worker requires a unix host");
}
