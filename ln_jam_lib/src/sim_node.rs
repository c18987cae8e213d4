// External Modules
use serde::{Serialize, Deserialize};

/*
 * This struct represents a node defined in a simulated network
 */
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimNode {
    pub alias: String,
    #[serde(default)]
    pub address: Option<String>, // the p2p address other nodes connect to, defaults to "<alias>.sim:9735"
}

impl SimNode {
    pub fn new(alias: &str) -> Self {
        SimNode {
            alias: String::from(alias),
            address: None
        }
    }

    pub fn p2p_address(&self) -> String {
        match &self.address {
            Some(a) => a.clone(),
            None => format!("{}.sim:9735", self.alias)
        }
    }
}
