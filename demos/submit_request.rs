//! Demo: host side that submits one txt2img request and prints the response.
//!
//! Start `echo_worker` first, or after this; the request is held and resent
//! once the worker comes up.
//!
//! ```bash
//! cargo run --example submit_request -- "a cat"
//! ```

use anyhow::{bail, Result};
use sd_bridge::logging::init_stderr_logging;
use sd_bridge::{BridgeConfig, ConnectionLifecycle, HostBridge, RequestKind};
use serde_json::{json, Value};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

fn main() -> Result<()> {
    init_stderr_logging("info")?;

    let prompt = std::env::args().nth(1).unwrap_or_else(|| "a cat".to_string());
    let config = BridgeConfig::default().with_env_overrides()?;

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let mut host = HostBridge::new(config, move |response: Value| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(response);
        }
    });
    host.start()?;

    let options = json!({"prompt": prompt, "seed": 42});
    host.submit(RequestKind::Txt2img, options.as_object().cloned().unwrap_or_default())?;

    let response = match rx.recv_timeout(Duration::from_secs(60)) {
        Ok(response) => response,
        Err(_) => {
            host.close();
            bail!("No response from worker within 60s");
        }
    };
    println!("{}", response);
    host.close();
    Ok(())
}
