// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Catalog of known integrations and the command-line matcher built from it.

use crate::DiscoveryError;
use regex::RegexSet;

/// A catalog entry: an integration and the command-line signatures that identify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integration {
    pub name: String,
    pub display_name: String,
    /// Regular expressions, any of which identifies the integration
    pub signatures: Vec<String>,
}

impl Integration {
    pub fn new(name: &str, display_name: &str, signatures: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            signatures: signatures.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

// Executable name at the start of the command line, optionally behind a path.
macro_rules! exe {
    ($name:literal) => {
        concat!(r"^(\S*/)?", $name, r"(\s|:|$)")
    };
}

/// Built-in integration catalog: `(name, display name, signatures)`.
const BUILTIN_CATALOG: &[(&str, &str, &[&str])] = &[
    ("apache", "Apache", &[exe!("httpd"), exe!("apache2")]),
    ("nginx", "NGINX", &[exe!("nginx"), r"^nginx: (master|worker) process"]),
    ("redisdb", "Redis", &[exe!("redis-server")]),
    ("mysql", "MySQL", &[exe!("mysqld"), exe!("mysqld_safe")]),
    ("postgres", "Postgres", &[exe!("postgres"), exe!("postmaster"), r"^postgres: "]),
    ("mongo", "MongoDB", &[exe!("mongod")]),
    ("memcache", "Memcached", &[exe!("memcached")]),
    ("haproxy", "HAProxy", &[exe!("haproxy")]),
    ("consul", "Consul", &[r"^(\S*/)?consul\s+agent"]),
    ("etcd", "etcd", &[exe!("etcd")]),
    ("varnish", "Varnish", &[exe!("varnishd")]),
    ("squid", "Squid", &[exe!("squid")]),
    ("lighttpd", "Lighttpd", &[exe!("lighttpd")]),
    ("php_fpm", "PHP-FPM", &[r"^php-fpm: master process", exe!(r"php-fpm[0-9.]*")]),
    ("gunicorn", "Gunicorn", &[r"gunicorn: master", exe!("gunicorn")]),
    ("supervisord", "Supervisord", &[exe!("supervisord"), r"/supervisord(\s|$)"]),
    ("docker", "Docker", &[exe!("dockerd")]),
    ("kubelet", "Kubelet", &[exe!("kubelet")]),
    ("fluentd", "Fluentd", &[r"\bfluentd\b"]),
    ("rabbitmq", "RabbitMQ", &[exe!("rabbitmq-server"), r"beam(\.smp)?\s.*-s rabbit\b"]),
    ("elastic", "Elasticsearch", &[r"org\.elasticsearch\.bootstrap\.Elasticsearch"]),
    ("kafka", "Kafka", &[r"\bkafka\.Kafka\b"]),
    ("zk", "ZooKeeper", &[r"org\.apache\.zookeeper\.server\.quorum\.QuorumPeerMain"]),
    ("cassandra", "Cassandra", &[r"org\.apache\.cassandra\.service\.CassandraDaemon"]),
    ("tomcat", "Tomcat", &[r"org\.apache\.catalina\.startup\.Bootstrap"]),
    ("couch", "CouchDB", &[r"\bcouchdb\b"]),
];

/// Matches command lines against an integration catalog.
///
/// All signatures are compiled into one [`RegexSet`]; the first catalog entry owning a matching
/// signature wins.
#[derive(Debug, Clone)]
pub struct Matcher {
    integrations: Vec<Integration>,
    signatures: RegexSet,
    // signature index -> integration index
    owners: Vec<usize>,
}

impl Matcher {
    pub fn new(catalog: Vec<Integration>) -> Result<Self, DiscoveryError> {
        let mut patterns = Vec::new();
        let mut owners = Vec::new();
        for (index, integration) in catalog.iter().enumerate() {
            for signature in &integration.signatures {
                patterns.push(signature.as_str());
                owners.push(index);
            }
        }

        let signatures = RegexSet::new(patterns).map_err(DiscoveryError::Matcher)?;
        Ok(Self {
            integrations: catalog,
            signatures,
            owners,
        })
    }

    /// Matcher over the built-in catalog.
    pub fn builtin() -> Result<Self, DiscoveryError> {
        Self::new(
            BUILTIN_CATALOG
                .iter()
                .map(|(name, display_name, signatures)| {
                    Integration::new(name, display_name, signatures)
                })
                .collect(),
        )
    }

    /// Returns the integration `cmdline` belongs to, if any.
    #[must_use]
    pub fn match_cmdline(&self, cmdline: &str) -> Option<&Integration> {
        let signature = self.signatures.matches(cmdline).iter().next()?;
        self.integrations.get(self.owners[signature])
    }

    #[must_use]
    pub fn integrations(&self) -> &[Integration] {
        &self.integrations
    }
}
