//! Per-provider Description Merge
//!
//! Each link keeps one timestamped description per provider. Incoming
//! descriptions are merged per provider; the merged [`Link`] is composed
//! from all of them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Annotations, DiscoveryMode, Link, LinkDescription, LinkState, LinkType, ProviderId, DURABLE};
use crate::store::timestamp::{Timestamp, Timestamped};

/// Type after a transition: once DIRECT, a link never falls back to INDIRECT
pub(crate) fn monotonic_type(previous: LinkType, incoming: LinkType) -> LinkType {
    if previous == LinkType::Direct && incoming == LinkType::Indirect {
        LinkType::Direct
    } else {
        incoming
    }
}

/// Provider -> timestamped description for one link.
///
/// Ordered by provider so composition is deterministic on every replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionMap {
    descriptions: BTreeMap<ProviderId, Timestamped<LinkDescription>>,
}

impl DescriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn get(&self, provider: &ProviderId) -> Option<&Timestamped<LinkDescription>> {
        self.descriptions.get(provider)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProviderId, &Timestamped<LinkDescription>)> {
        self.descriptions.iter()
    }

    pub fn clear(&mut self) {
        self.descriptions.clear();
    }

    /// Merge a provider's description.
    ///
    /// Returns `false` (and changes nothing) when the incoming description
    /// is not newer than the one held for the same provider. Otherwise the
    /// stored description takes the incoming fields, keeps DIRECT if it was
    /// DIRECT, and unions annotations with incoming values winning.
    pub fn merge(&mut self, provider: &ProviderId, incoming: Timestamped<LinkDescription>) -> bool {
        let merged = match self.descriptions.get(provider) {
            Some(existing) if !incoming.is_newer(existing) => {
                tracing::trace!("Local description from {} is up to date, ignoring", provider);
                return false;
            }
            Some(existing) => {
                let timestamp = incoming.timestamp();
                let mut description = incoming.into_value();
                description.link_type = monotonic_type(existing.value().link_type, description.link_type);
                let mut annotations = existing.value().annotations.clone();
                annotations.append(&mut description.annotations);
                description.annotations = annotations;
                Timestamped::new(description, timestamp)
            }
            None => incoming,
        };
        self.descriptions.insert(provider.clone(), merged);
        true
    }

    /// Description of the first primary (non-ancillary) provider
    pub fn primary(&self) -> Option<&Timestamped<LinkDescription>> {
        self.descriptions
            .iter()
            .find(|(provider, _)| !provider.is_ancillary())
            .map(|(_, description)| description)
    }

    /// The provider supplying base fields: the first primary provider, or
    /// the first ancillary one when no primary exists
    pub fn base_provider(&self) -> Option<&ProviderId> {
        self.descriptions
            .keys()
            .find(|provider| !provider.is_ancillary())
            .or_else(|| self.descriptions.keys().next())
    }

    /// Newest timestamp across all providers
    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.descriptions.values().map(|d| d.timestamp()).max()
    }

    /// Compose the merged link, `None` when no description is held
    pub fn compose(&self, mode: DiscoveryMode) -> Option<Link> {
        let base_provider = self.base_provider()?;
        let base = self.descriptions.get(base_provider)?;

        let mut link_type = base.value().link_type;
        let mut annotations: BTreeMap<&String, (&String, Timestamp)> = base
            .value()
            .annotations
            .iter()
            .map(|(k, v)| (k, (v, base.timestamp())))
            .collect();

        for (provider, description) in &self.descriptions {
            if provider == base_provider {
                continue;
            }
            link_type = description.value().link_type.max_strength(link_type);
            for (key, value) in &description.value().annotations {
                match annotations.get(key) {
                    // on collision the fresher provider wins
                    Some((_, owner)) if !description.timestamp().is_newer_than(owner) => {}
                    _ => {
                        annotations.insert(key, (value, description.timestamp()));
                    }
                }
            }
        }

        let annotations: Annotations = annotations
            .into_iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect();
        let is_durable = annotations.get(DURABLE).map(String::as_str) == Some("true");

        let (state, is_expected) = match mode {
            DiscoveryMode::Permissive => (LinkState::Active, is_durable),
            DiscoveryMode::Strict => {
                let expected = base.value().is_expected;
                let state = if expected {
                    LinkState::Active
                } else {
                    LinkState::Inactive
                };
                (state, expected)
            }
        };

        Some(Link {
            provider: base_provider.clone(),
            src: base.value().src.clone(),
            dst: base.value().dst.clone(),
            link_type,
            state,
            is_durable,
            is_expected,
            annotations,
        })
    }
}

impl LinkType {
    /// DIRECT reported by any provider outranks INDIRECT from the base
    fn max_strength(self, current: LinkType) -> LinkType {
        if self == LinkType::Direct && current == LinkType::Indirect {
            LinkType::Direct
        } else {
            current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::link::ConnectPoint;

    fn desc(link_type: LinkType) -> LinkDescription {
        LinkDescription::new(ConnectPoint::new("of:1", 1), ConnectPoint::new("of:2", 1), link_type)
    }

    fn ts(seq: u64) -> Timestamp {
        Timestamp::new(1, seq)
    }

    #[test]
    fn test_stale_and_duplicate_ignored() {
        let p = ProviderId::new("lldp", "core");
        let mut map = DescriptionMap::new();
        assert!(map.merge(&p, Timestamped::new(desc(LinkType::Indirect), ts(2))));
        assert!(!map.merge(&p, Timestamped::new(desc(LinkType::Direct), ts(2))));
        assert!(!map.merge(&p, Timestamped::new(desc(LinkType::Direct), ts(1))));
        assert_eq!(map.get(&p).unwrap().value().link_type, LinkType::Indirect);
    }

    #[test]
    fn test_direct_never_downgrades_per_provider() {
        let p = ProviderId::new("lldp", "core");
        let mut map = DescriptionMap::new();
        map.merge(&p, Timestamped::new(desc(LinkType::Direct), ts(1)));
        map.merge(&p, Timestamped::new(desc(LinkType::Indirect), ts(2)));
        assert_eq!(map.get(&p).unwrap().value().link_type, LinkType::Direct);
        assert_eq!(map.get(&p).unwrap().timestamp(), ts(2));
    }

    #[test]
    fn test_annotations_union_per_provider() {
        let p = ProviderId::new("lldp", "core");
        let mut map = DescriptionMap::new();
        map.merge(&p, Timestamped::new(desc(LinkType::Direct).annotate("a", "1").annotate("b", "1"), ts(1)));
        map.merge(&p, Timestamped::new(desc(LinkType::Direct).annotate("b", "2"), ts(2)));

        let link = map.compose(DiscoveryMode::Permissive).unwrap();
        assert_eq!(link.annotations.get("a").map(String::as_str), Some("1"));
        assert_eq!(link.annotations.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_base_provider_and_ancillary_annotations() {
        let primary = ProviderId::new("lldp", "core");
        let extra = ProviderId::ancillary("cfg", "netcfg");
        let mut map = DescriptionMap::new();

        map.merge(&extra, Timestamped::new(desc(LinkType::Optical).annotate("latency", "5"), ts(1)));
        assert_eq!(map.base_provider(), Some(&extra));
        assert!(map.primary().is_none());

        map.merge(&primary, Timestamped::new(desc(LinkType::Indirect).annotate("latency", "3"), ts(2)));
        assert_eq!(map.base_provider(), Some(&primary));

        let link = map.compose(DiscoveryMode::Permissive).unwrap();
        assert_eq!(link.provider, primary);
        assert_eq!(link.link_type, LinkType::Indirect);
        // the primary's value is fresher
        assert_eq!(link.annotations.get("latency").map(String::as_str), Some("3"));

        map.merge(&extra, Timestamped::new(desc(LinkType::Optical).annotate("latency", "7"), ts(3)));
        let link = map.compose(DiscoveryMode::Permissive).unwrap();
        assert_eq!(link.annotations.get("latency").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_direct_from_any_provider_wins_in_compose() {
        let p1 = ProviderId::new("bddp", "a");
        let p2 = ProviderId::new("lldp", "b");
        let mut map = DescriptionMap::new();
        map.merge(&p1, Timestamped::new(desc(LinkType::Indirect), ts(1)));
        map.merge(&p2, Timestamped::new(desc(LinkType::Direct), ts(2)));
        assert_eq!(map.compose(DiscoveryMode::Permissive).unwrap().link_type, LinkType::Direct);
    }

    #[test]
    fn test_discovery_modes() {
        let p = ProviderId::new("lldp", "core");
        let mut map = DescriptionMap::new();
        map.merge(&p, Timestamped::new(desc(LinkType::Direct), ts(1)));

        let permissive = map.compose(DiscoveryMode::Permissive).unwrap();
        assert_eq!(permissive.state, LinkState::Active);
        assert!(!permissive.is_expected);

        let strict = map.compose(DiscoveryMode::Strict).unwrap();
        assert_eq!(strict.state, LinkState::Inactive);

        map.merge(&p, Timestamped::new(desc(LinkType::Direct).expected(true).annotate(DURABLE, "true"), ts(2)));
        let strict = map.compose(DiscoveryMode::Strict).unwrap();
        assert_eq!(strict.state, LinkState::Active);
        assert!(strict.is_expected);
        assert!(strict.is_durable);
        assert!(map.compose(DiscoveryMode::Permissive).unwrap().is_expected);
    }

    #[test]
    fn test_empty_map_composes_nothing() {
        assert!(DescriptionMap::new().compose(DiscoveryMode::Permissive).is_none());
        assert!(DescriptionMap::new().latest_timestamp().is_none());
    }
}
