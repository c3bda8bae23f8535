//! Guest bootstrap binary. Run once at agent start inside the VM: reads the
//! bootstrap blob from guest metadata and rewrites the agent's properties
//! file, freezing the machine first when it is an unfrozen template.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{error, info};

use instaclone_agent::bootstrap::{FREEZE_SCRIPT_PARAMETER, RPC_TOOL_PARAMETER};
use instaclone_agent::{AgentConfigStore, AgentResult, GuestBootstrap, RpcTool};

/// `key=value` properties file, the local agent configuration format.
struct PropertiesConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl PropertiesConfigStore {
    fn load(path: impl Into<PathBuf>) -> AgentResult<Self> {
        let path = path.into();
        let mut values = BTreeMap::new();
        if path.exists() {
            for line in std::fs::read_to_string(&path)?.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    values.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn save(&self) -> AgentResult<()> {
        let values = self.values.lock().unwrap();
        let mut out = String::new();
        for (key, value) in values.iter() {
            out.push_str(&format!("{key}={value}\n"));
        }
        std::fs::write(&self.path, out)?;
        Ok(())
    }
}

impl AgentConfigStore for PropertiesConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!("Starting instaclone guest bootstrap...");

    let properties = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "conf/buildAgent.properties".to_string());
    let store = match PropertiesConfigStore::load(&properties) {
        Ok(store) => store,
        Err(cause) => {
            error!(path = %properties, error = %cause, "cannot read agent properties");
            return;
        }
    };

    let Some(rpc) = RpcTool::locate(store.get(RPC_TOOL_PARAMETER).as_deref()) else {
        info!("rpctool wasn't found, not a managed VM");
        return;
    };

    let bootstrap = GuestBootstrap::new(rpc, store.get(FREEZE_SCRIPT_PARAMETER));
    match bootstrap.initialize(&store).await {
        Ok(true) => {
            if let Err(cause) = store.save() {
                error!(error = %cause, "failed to write agent properties");
                return;
            }
            info!(path = %properties, "agent properties updated");
        }
        Ok(false) => {
            info!("no instance metadata available, configuration left untouched");
        }
        Err(cause) => {
            error!(error = %cause, "guest bootstrap failed");
        }
    }
}
