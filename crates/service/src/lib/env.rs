use std::env;
use std::fmt::Debug;
use std::str::FromStr;

#[derive(Clone, Copy)]
pub struct EnvVarSpec {
    pub key: &'static str,
    pub sensitive: bool,
}

#[derive(Clone)]
pub struct EnvVarValue<TVal> {
    pub spec: &'static EnvVarSpec,
    pub value: TVal,
}

impl EnvVarSpec {
    pub fn default<TVal: FromStr>(&'static self, default: TVal) -> EnvVarValue<TVal> {
        let as_optional = self.optional();
        EnvVarValue {
            spec: as_optional.spec,
            value: as_optional.value.unwrap_or(default),
        }
    }

    pub fn optional<TVal: FromStr>(&'static self) -> EnvVarValue<Option<TVal>> {
        let value = match env::var(self.key) {
            Ok(val) => {
                let parsed = val
                    .parse()
                    .unwrap_or_else(|_e| panic!("Failed to parse env var {}", self.key));
                Some(parsed)
            }
            Err(e) => {
                ::tracing::debug!("Failed reading env var {}: {e:?}", self.key);
                None
            }
        };
        EnvVarValue { spec: self, value }
    }

    pub fn required<TVal: FromStr>(&'static self) -> EnvVarValue<TVal> {
        let raw_value = env::var(self.key).unwrap_or_else(|e| panic!("Failed to read env var {}: {e:?}", self.key));
        match raw_value.parse() {
            Ok(value) => EnvVarValue { spec: self, value },
            Err(_e) => {
                panic!("Failed to parse value {} for env var {}", raw_value, self.key)
            }
        }
    }

    /// Comma-separated list, e.g. a fallback provider set.
    pub fn required_list(&'static self) -> EnvVarValue<Vec<String>> {
        let raw_value = env::var(self.key).unwrap_or_else(|e| panic!("Failed to read env var {}: {e:?}", self.key));
        let value: Vec<String> = raw_value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if value.is_empty() {
            panic!("Env var {} must contain at least one entry", self.key);
        }
        EnvVarValue { spec: self, value }
    }
}

impl<TVal: Debug> Debug for EnvVarValue<TVal> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.spec.sensitive {
            f.write_str("***")
        } else {
            f.write_fmt(format_args!("{:?}", self.value))
        }
    }
}

pub const LOG_FORMAT: EnvVarSpec = EnvVarSpec {
    key: "LOG_FORMAT",
    sensitive: false,
};
pub const DRY_RUN: EnvVarSpec = EnvVarSpec {
    key: "DRY_RUN",
    sensitive: false,
};
pub const CACHE_PATH: EnvVarSpec = EnvVarSpec {
    key: "CACHE_PATH",
    sensitive: false,
};
pub const PROMETHEUS_NAMESPACE: EnvVarSpec = EnvVarSpec {
    key: "PROMETHEUS_NAMESPACE",
    sensitive: false,
};
pub const METRICS_BIND_TO_ADDR: EnvVarSpec = EnvVarSpec {
    key: "METRICS_BIND_TO_ADDR",
    sensitive: false,
};

pub const EXECUTION_CLIENT_URI: EnvVarSpec = EnvVarSpec {
    key: "EXECUTION_CLIENT_URI",
    sensitive: true,
};
pub const CONSENSUS_CLIENT_URI: EnvVarSpec = EnvVarSpec {
    key: "CONSENSUS_CLIENT_URI",
    sensitive: true,
};
pub const IPFS_API_URI: EnvVarSpec = EnvVarSpec {
    key: "IPFS_API_URI",
    sensitive: true,
};
pub const IPFS_GATEWAY_URI: EnvVarSpec = EnvVarSpec {
    key: "IPFS_GATEWAY_URI",
    sensitive: true,
};

pub const MEMBER_PRIV_KEY: EnvVarSpec = EnvVarSpec {
    key: "MEMBER_PRIV_KEY",
    sensitive: true,
};
pub const LIDO_LOCATOR_ADDRESS: EnvVarSpec = EnvVarSpec {
    key: "LIDO_LOCATOR_ADDRESS",
    sensitive: false,
};
pub const LIDO_WITHDRAWAL_CREDENTIALS: EnvVarSpec = EnvVarSpec {
    key: "LIDO_WITHDRAWAL_CREDENTIALS",
    sensitive: false,
};
pub const CSM_MODULE_ADDRESS: EnvVarSpec = EnvVarSpec {
    key: "CSM_MODULE_ADDRESS",
    sensitive: false,
};
pub const CS_FEE_ORACLE_ADDRESS: EnvVarSpec = EnvVarSpec {
    key: "CS_FEE_ORACLE_ADDRESS",
    sensitive: false,
};
pub const CS_STRIKES_ADDRESS: EnvVarSpec = EnvVarSpec {
    key: "CS_STRIKES_ADDRESS",
    sensitive: false,
};

pub const SUBMIT_DATA_DELAY_IN_SLOTS: EnvVarSpec = EnvVarSpec {
    key: "SUBMIT_DATA_DELAY_IN_SLOTS",
    sensitive: false,
};
pub const ORACLE_MAX_CONCURRENCY: EnvVarSpec = EnvVarSpec {
    key: "ORACLE_MAX_CONCURRENCY",
    sensitive: false,
};
