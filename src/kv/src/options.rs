// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster-level options: per-service timeouts, TLS and network knobs, and
//! the recognized connection-string parameter subset.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use cbx_error::{CommonError, Error};
use cbx_topology::ReadPreference;
use tracing::warn;

use crate::retry::{BestEffortRetryStrategy, RetryStrategy};

/// Default timeouts per service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutOptions {
    pub bootstrap: Duration,
    pub resolve: Duration,
    pub connect: Duration,
    pub key_value: Duration,
    pub key_value_durable: Duration,
    pub view: Duration,
    pub query: Duration,
    pub analytics: Duration,
    pub search: Duration,
    pub management: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        TimeoutOptions {
            bootstrap: Duration::from_secs(10),
            resolve: Duration::from_secs(2),
            connect: Duration::from_secs(10),
            key_value: Duration::from_millis(2_500),
            key_value_durable: Duration::from_secs(10),
            view: Duration::from_secs(75),
            query: Duration::from_secs(75),
            analytics: Duration::from_secs(75),
            search: Duration::from_secs(75),
            management: Duration::from_secs(75),
        }
    }
}

/// IP protocol preference for connecting sockets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpProtocol {
    #[default]
    Any,
    ForceIpv4,
    ForceIpv6,
}

/// How TLS peer certificates are verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsVerifyMode {
    None,
    #[default]
    Peer,
}

/// Options a cluster is constructed with.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub enable_tls: bool,
    pub enable_dns_srv: bool,
    pub enable_mutation_tokens: bool,
    pub ip_protocol: IpProtocol,
    pub tls_verify: TlsVerifyMode,
    pub trust_certificate: String,
    pub user_agent_extra: String,
    pub network: String,
    /// The server-group tag used by zone-aware replica reads.
    pub preferred_server_group: String,
    pub read_preference: ReadPreference,
    pub timeouts: TimeoutOptions,
    pub default_retry_strategy: Arc<dyn RetryStrategy>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            enable_tls: false,
            enable_dns_srv: true,
            enable_mutation_tokens: true,
            ip_protocol: IpProtocol::default(),
            tls_verify: TlsVerifyMode::default(),
            trust_certificate: String::new(),
            user_agent_extra: String::new(),
            network: "auto".to_string(),
            preferred_server_group: String::new(),
            read_preference: ReadPreference::default(),
            timeouts: TimeoutOptions::default(),
            default_retry_strategy: Arc::new(BestEffortRetryStrategy),
        }
    }
}

/// A named bundle of option overrides applied at cluster construction.
pub trait ConfigProfile: Debug + Send + Sync {
    fn apply(&self, options: &mut ClusterOptions);
}

/// Raises every timeout for development against a distant cluster over a
/// high-latency link.
#[derive(Debug, Default, Clone, Copy)]
pub struct WanDevelopmentProfile;

impl ConfigProfile for WanDevelopmentProfile {
    fn apply(&self, options: &mut ClusterOptions) {
        options.timeouts.key_value = Duration::from_secs(20);
        options.timeouts.key_value_durable = Duration::from_secs(20);
        options.timeouts.connect = Duration::from_secs(20);
        options.timeouts.view = Duration::from_secs(120);
        options.timeouts.query = Duration::from_secs(120);
        options.timeouts.analytics = Duration::from_secs(120);
        options.timeouts.search = Duration::from_secs(120);
        options.timeouts.management = Duration::from_secs(120);
        options.timeouts.resolve = Duration::from_secs(20);
        options.timeouts.bootstrap = Duration::from_secs(120);
    }
}

impl ClusterOptions {
    pub fn apply_profile(&mut self, profile: &dyn ConfigProfile) {
        profile.apply(self);
    }

    /// Applies the recognized connection-string parameters. Unknown keys
    /// and unparseable values produce warnings and leave the defaults;
    /// they never fail.
    pub fn apply_connection_string_params(
        &mut self,
        params: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        for (key, value) in params {
            match key.as_str() {
                "enable_tls" => {
                    self.apply_bool(&mut warnings, key, value, |options, v| {
                        options.enable_tls = v;
                    });
                }
                "enable_dns_srv" => {
                    self.apply_bool(&mut warnings, key, value, |options, v| {
                        options.enable_dns_srv = v;
                    });
                }
                "enable_mutation_tokens" => {
                    self.apply_bool(&mut warnings, key, value, |options, v| {
                        options.enable_mutation_tokens = v;
                    });
                }
                "ip_protocol" => match value.as_str() {
                    "any" => self.ip_protocol = IpProtocol::Any,
                    "force_ipv4" => self.ip_protocol = IpProtocol::ForceIpv4,
                    "force_ipv6" => self.ip_protocol = IpProtocol::ForceIpv6,
                    _ => warnings.push(format!(
                        "unable to parse \"{}\" parameter in connection string (value \"{}\" is not a valid IP protocol preference)",
                        key, value
                    )),
                },
                "tls_verify" => match value.as_str() {
                    "none" => self.tls_verify = TlsVerifyMode::None,
                    "peer" => self.tls_verify = TlsVerifyMode::Peer,
                    _ => warnings.push(format!(
                        "unable to parse \"{}\" parameter in connection string (value \"{}\" is not a valid TLS verification mode)",
                        key, value
                    )),
                },
                "user_agent_extra" => self.user_agent_extra = value.clone(),
                "trust_certificate" => self.trust_certificate = value.clone(),
                "network" => self.network = value.clone(),
                "preferred_server_group" => self.preferred_server_group = value.clone(),
                "bootstrap_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.bootstrap = v;
                    });
                }
                "resolve_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.resolve = v;
                    });
                }
                "connect_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.connect = v;
                    });
                }
                "kv_timeout" | "key_value_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.key_value = v;
                    });
                }
                "kv_durable_timeout" | "key_value_durable_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.key_value_durable = v;
                    });
                }
                "view_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.view = v;
                    });
                }
                "query_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.query = v;
                    });
                }
                "analytics_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.analytics = v;
                    });
                }
                "search_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.search = v;
                    });
                }
                "management_timeout" => {
                    self.apply_duration(&mut warnings, key, value, |options, v| {
                        options.timeouts.management = v;
                    });
                }
                _ => warnings.push(format!(
                    "unknown parameter \"{}\" in connection string (value \"{}\")",
                    key, value
                )),
            }
        }
        for warning in &warnings {
            warn!("{}", warning);
        }
        warnings
    }

    fn apply_bool(
        &mut self,
        warnings: &mut Vec<String>,
        key: &str,
        value: &str,
        set: impl FnOnce(&mut Self, bool),
    ) {
        match parse_bool(value) {
            Some(parsed) => set(self, parsed),
            None => warnings.push(format!(
                "unable to parse \"{}\" parameter in connection string (value \"{}\" cannot be interpreted as a boolean)",
                key, value
            )),
        }
    }

    fn apply_duration(
        &mut self,
        warnings: &mut Vec<String>,
        key: &str,
        value: &str,
        set: impl FnOnce(&mut Self, Duration),
    ) {
        match parse_duration(value) {
            Ok(parsed) => set(self, parsed),
            Err(_) => warnings.push(format!(
                "unable to parse \"{}\" parameter in connection string (value \"{}\" is not a number)",
                key, value
            )),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses a duration: either a bare number of milliseconds (`"42"`) or a
/// compound unit string (`"4s2ms"`, `"1m30s"`). Recognized units: `h`,
/// `m`, `s`, `ms`, `us`, `ns`.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    if input.is_empty() {
        return Err(CommonError::InvalidArgument.into());
    }
    if let Ok(millis) = input.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }

    let mut total = Duration::ZERO;
    let mut chars = input.chars().peekable();
    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                number.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if number.is_empty() || unit.is_empty() {
            return Err(CommonError::ParsingFailure.into());
        }
        let value: u64 = number
            .parse()
            .map_err(|_| Error::from(CommonError::ParsingFailure))?;
        let part = match unit.as_str() {
            "h" => Duration::from_secs(value * 3_600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "us" => Duration::from_micros(value),
            "ns" => Duration::from_nanos(value),
            _ => return Err(CommonError::ParsingFailure.into()),
        };
        total += part;
    }
    Ok(total)
}
