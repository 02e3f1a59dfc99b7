use crate::models::{ContextHost, ContextHostRow, Tier};
use crate::search::authority;
use tracing::debug;

/// Classifies a host by comparing its declared owner against the manufacturer.
pub fn derive_tier(manufacturer: &str, enterprise_name: Option<&str>) -> Tier {
    let Some(owner) = enterprise_name.map(str::trim).filter(|v| !v.is_empty()) else {
        return Tier::Unknown;
    };
    if owner.eq_ignore_ascii_case(manufacturer.trim()) {
        Tier::Oem
    } else if owner.eq_ignore_ascii_case("DISTRIBUTOR") {
        Tier::Distributor
    } else {
        Tier::Enterprise
    }
}

/// Ordered, deduplicated hosts for one manufacturer: OEM, Enterprise, Distributor,
/// Unknown, table order within each tier.
pub fn resolve_hosts(manufacturer: &str, table: &[ContextHostRow]) -> Vec<ContextHost> {
    let wanted = manufacturer.trim();
    let mut hosts: Vec<ContextHost> = Vec::new();
    for row in table
        .iter()
        .filter(|row| row.manufacturer.trim().eq_ignore_ascii_case(wanted))
    {
        let host = authority(&row.url).unwrap_or_else(|| row.url.trim().to_lowercase());
        if host.is_empty() {
            continue;
        }
        let tier = derive_tier(&row.manufacturer, row.enterprise_name.as_deref());
        if hosts.iter().any(|h| h.host == host && h.tier == tier) {
            continue;
        }
        hosts.push(ContextHost {
            manufacturer: row.manufacturer.clone(),
            host,
            tier,
        });
    }
    // stable: table order survives within a tier
    hosts.sort_by_key(|h| h.tier);
    hosts
}

/// Remembers the resolution for the most recent manufacturer so adjacent entries of
/// the same manufacturer skip the table scan.
#[derive(Debug, Default)]
pub struct TierCache {
    manufacturer: Option<String>,
    hosts: Vec<ContextHost>,
}

impl TierCache {
    pub fn resolve(&mut self, manufacturer: &str, table: &[ContextHostRow]) -> &[ContextHost] {
        if self.manufacturer.as_deref() != Some(manufacturer) {
            self.hosts = resolve_hosts(manufacturer, table);
            self.manufacturer = Some(manufacturer.to_string());
            debug!(
                target = "imagery.pipeline",
                manufacturer = %manufacturer,
                hosts = self.hosts.len(),
                "host_tiers_resolved"
            );
        }
        &self.hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(manufacturer: &str, url: &str, owner: Option<&str>) -> ContextHostRow {
        ContextHostRow {
            manufacturer: manufacturer.into(),
            url: url.into(),
            enterprise_name: owner.map(str::to_string),
        }
    }

    #[test]
    fn tier_derivation_rules() {
        assert_eq!(derive_tier("Acme", Some(" acme ")), Tier::Oem);
        assert_eq!(derive_tier("Acme", Some("Distributor")), Tier::Distributor);
        assert_eq!(derive_tier("Acme", Some("Parent Holdings")), Tier::Enterprise);
        assert_eq!(derive_tier("Acme", None), Tier::Unknown);
        assert_eq!(derive_tier("Acme", Some("  ")), Tier::Unknown);
    }

    #[test]
    fn hosts_are_ordered_by_tier_then_table_order() {
        let table = vec![
            row("Acme", "https://dist-one.example/catalog", Some("DISTRIBUTOR")),
            row("Acme", "https://unknown.example", None),
            row("Acme", "https://parent.example", Some("Parent Co")),
            row("Acme", "https://www.acme.com/products", Some("Acme")),
            row("Acme", "https://dist-two.example", Some("DISTRIBUTOR")),
            row("Other", "https://other.example", Some("Other")),
        ];
        let hosts = resolve_hosts("Acme", &table);
        let view: Vec<(&str, Tier)> = hosts.iter().map(|h| (h.host.as_str(), h.tier)).collect();
        assert_eq!(
            view,
            vec![
                ("www.acme.com", Tier::Oem),
                ("parent.example", Tier::Enterprise),
                ("dist-one.example", Tier::Distributor),
                ("dist-two.example", Tier::Distributor),
                ("unknown.example", Tier::Unknown),
            ]
        );
    }

    #[test]
    fn duplicates_collapse_by_host_and_tier() {
        let table = vec![
            row("Acme", "https://acme.com/a", Some("Acme")),
            row("Acme", "https://acme.com/b", Some("Acme")),
            row("Acme", "acme.com", Some("Parent")),
        ];
        let hosts = resolve_hosts("Acme", &table);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].tier, Tier::Oem);
        assert_eq!(hosts[1].tier, Tier::Enterprise);
        assert_eq!(hosts[1].host, "acme.com");
    }

    #[test]
    fn unknown_manufacturer_resolves_to_nothing() {
        let table = vec![row("Acme", "https://acme.com", Some("Acme"))];
        assert!(resolve_hosts("Beta", &table).is_empty());
    }

    #[test]
    fn cache_matches_fresh_resolution() {
        let table = vec![
            row("Acme", "https://acme.com", Some("Acme")),
            row("Beta", "https://beta.example", None),
        ];
        let mut cache = TierCache::default();
        for manufacturer in ["Acme", "Acme", "Beta", "Acme"] {
            let cached = cache.resolve(manufacturer, &table).to_vec();
            assert_eq!(cached, resolve_hosts(manufacturer, &table));
        }
    }
}
