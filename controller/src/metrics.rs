//! Metrics contains the remediation metrics reported by the NodeHealthCheck reconcilers.
//!
//! Both instruments are partitioned by label values and grow one series per distinct
//! label combination. Series are never evicted: cardinality follows the number of
//! NodeHealthChecks and remediation kinds seen since the process started.

use std::sync::atomic::{AtomicBool, Ordering};

use kube::{Resource, ResourceExt};
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, core::Collector};

use crate::prelude::*;

/// Metric name of the old remediation CR counter.
pub const OLD_REMEDIATION_CR: &str = "nodehealthcheck_old_remediation_cr";
/// Metric name of the ongoing remediation gauge.
pub const ONGOING_REMEDIATION: &str = "nodehealthcheck_ongoing_remediation";

pub const LABEL_NAME: &str = "name";
pub const LABEL_NAMESPACE: &str = "namespace";
pub const LABEL_REMEDIATION: &str = "remediation";

/// Metrics owns the NodeHealthCheck instruments and the registry they are exposed through.
///
/// The lifecycle is: [`Metrics::new`] (constructed) → [`Metrics::initialize`] (registered)
/// → any number of observations. Observations made before a successful initialize are
/// refused with [`Error::UnregisteredInstrument`] and leave the instruments untouched.
pub struct Metrics {
    registry: Registry,
    /// Old_remediation_cr counts remediation CRs that stayed open for too long.
    /// A growing value points at a stuck or misbehaving remediation backend.
    old_remediation_cr: IntCounterVec,
    /// Ongoing_remediation is 1 while a remediation of a node is in progress, 0 after.
    ongoing_remediation: IntGaugeVec,
    registered: AtomicBool,
}

impl Metrics {
    /// New constructs both instruments bound to `registry`. Nothing is registered yet.
    pub fn new(registry: Registry) -> Result<Self> {
        let old_remediation_cr = IntCounterVec::new(
            Opts::new(
                OLD_REMEDIATION_CR,
                "Number of old remediation CRs detected by NodeHealthChecks",
            ),
            &[LABEL_NAME, LABEL_NAMESPACE],
        )?;
        let ongoing_remediation = IntGaugeVec::new(
            Opts::new(
                ONGOING_REMEDIATION,
                "Indication of an ongoing remediation of an unhealthy node",
            ),
            &[LABEL_NAME, LABEL_NAMESPACE, LABEL_REMEDIATION],
        )?;
        Ok(Self {
            registry,
            old_remediation_cr,
            ongoing_remediation,
            registered: AtomicBool::new(false),
        })
    }

    /// Initialize registers both instruments with the registry.
    ///
    /// This must be called exactly once during startup. A second call, or a registry that
    /// already holds a metric of the same name, reports [`Error::DuplicateRegistration`].
    /// If the gauge is refused after the counter was accepted, the counter is unregistered
    /// again so a later retry can register both. The registry still remembers the counter's
    /// name with its help and label names, as prometheus never forgets a descriptor shape.
    pub fn initialize(&self) -> Result<()> {
        register(
            &self.registry,
            OLD_REMEDIATION_CR,
            self.old_remediation_cr.clone(),
        )?;
        if let Err(err) = register(
            &self.registry,
            ONGOING_REMEDIATION,
            self.ongoing_remediation.clone(),
        ) {
            debug!(metric = OLD_REMEDIATION_CR, "rolling back registration");
            if let Err(e) = self
                .registry
                .unregister(Box::new(self.old_remediation_cr.clone()))
            {
                warn!(metric = OLD_REMEDIATION_CR, "unable to roll back registration: {e}");
            }
            return Err(err);
        }
        self.registered.store(true, Ordering::Release);
        info!(
            metrics = ?[OLD_REMEDIATION_CR, ONGOING_REMEDIATION],
            "registered nodehealthcheck metrics"
        );
        Ok(())
    }

    /// Is_initialized reports whether [`Metrics::initialize`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record_stale_remediation counts one old remediation CR for the NodeHealthCheck
    /// `name`/`namespace`.
    #[instrument(level = "debug", skip(self))]
    pub fn record_stale_remediation(&self, name: &str, namespace: &str) -> Result<()> {
        self.ensure_registered(OLD_REMEDIATION_CR)?;
        self.old_remediation_cr
            .with_label_values(&[name, namespace])
            .inc();
        debug!("recorded old remediation CR");
        Ok(())
    }

    /// Mark_remediation_started sets the ongoing remediation indicator to 1.
    ///
    /// Repeated calls keep the value at 1.
    #[instrument(level = "debug", skip(self))]
    pub fn mark_remediation_started(
        &self,
        name: &str,
        namespace: &str,
        remediation: &str,
    ) -> Result<()> {
        self.set_ongoing(name, namespace, remediation, 1)
    }

    /// Mark_remediation_stopped sets the ongoing remediation indicator to 0.
    ///
    /// No prior start is needed: an unseen combination is created at 0.
    #[instrument(level = "debug", skip(self))]
    pub fn mark_remediation_stopped(
        &self,
        name: &str,
        namespace: &str,
        remediation: &str,
    ) -> Result<()> {
        self.set_ongoing(name, namespace, remediation, 0)
    }

    /// Record_stale_remediation_for is [`Metrics::record_stale_remediation`] with the
    /// labels taken from `obj`'s metadata.
    pub fn record_stale_remediation_for<K: Resource>(&self, obj: &K) -> Result<()> {
        let (name, namespace) = identity(obj);
        self.record_stale_remediation(&name, &namespace)
    }

    pub fn mark_remediation_started_for<K: Resource>(
        &self,
        obj: &K,
        remediation: &str,
    ) -> Result<()> {
        let (name, namespace) = identity(obj);
        self.mark_remediation_started(&name, &namespace, remediation)
    }

    pub fn mark_remediation_stopped_for<K: Resource>(
        &self,
        obj: &K,
        remediation: &str,
    ) -> Result<()> {
        let (name, namespace) = identity(obj);
        self.mark_remediation_stopped(&name, &namespace, remediation)
    }

    /// Stale_remediations returns the counter value for `name`/`namespace`, or `None` if
    /// that combination was never observed.
    ///
    /// This walks every series of the counter, so it is meant for diagnostics and tests,
    /// not for hot paths.
    pub fn stale_remediations(&self, name: &str, namespace: &str) -> Option<u64> {
        let values = [name, namespace];
        has_series(
            &self.old_remediation_cr,
            &[LABEL_NAME, LABEL_NAMESPACE],
            &values,
        )
        .then(|| self.old_remediation_cr.with_label_values(&values).get())
    }

    /// Ongoing_remediation returns the indicator value for the combination, or `None` if
    /// it was never observed. Like [`Metrics::stale_remediations`] this is O(series).
    pub fn ongoing_remediation(
        &self,
        name: &str,
        namespace: &str,
        remediation: &str,
    ) -> Option<i64> {
        let values = [name, namespace, remediation];
        has_series(
            &self.ongoing_remediation,
            &[LABEL_NAME, LABEL_NAMESPACE, LABEL_REMEDIATION],
            &values,
        )
        .then(|| self.ongoing_remediation.with_label_values(&values).get())
    }

    fn set_ongoing(&self, name: &str, namespace: &str, remediation: &str, v: i64) -> Result<()> {
        self.ensure_registered(ONGOING_REMEDIATION)?;
        self.ongoing_remediation
            .with_label_values(&[name, namespace, remediation])
            .set(v);
        debug!(value = v, "set ongoing remediation");
        Ok(())
    }

    fn ensure_registered(&self, metric: &'static str) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        warn!(metric, "observation before metrics were initialized");
        Err(Error::UnregisteredInstrument { metric })
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

fn register<C>(registry: &Registry, metric: &'static str, c: C) -> Result<()>
where
    C: Collector + 'static,
{
    registry.register(Box::new(c)).map_err(|err| match err {
        prometheus::Error::AlreadyReg => Error::DuplicateRegistration { metric },
        // Same name but different const labels, label names or help.
        prometheus::Error::Msg(ref msg) if msg.contains("same fully-qualified name") => {
            Error::DuplicateRegistration { metric }
        }
        source => Error::Register { metric, source },
    })
}

// Has_series reports whether the collector currently holds a series with exactly these
// label values. Unlike `with_label_values`, this never creates one.
fn has_series(c: &dyn Collector, names: &[&str], values: &[&str]) -> bool {
    c.collect()
        .iter()
        .flat_map(|mf| mf.get_metric())
        .any(|m| {
            names.iter().zip(values).all(|(n, v)| {
                m.get_label()
                    .iter()
                    .any(|lp| lp.get_name() == *n && lp.get_value() == *v)
            })
        })
}

// Cluster-scoped objects (NodeHealthCheck is one) report an empty namespace.
fn identity<K: Resource>(obj: &K) -> (String, String) {
    (obj.name_any(), obj.namespace().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn initialized() -> Result<Metrics> {
        let m = Metrics::new(Registry::new())?;
        m.initialize()?;
        Ok(m)
    }

    #[test]
    fn observation_before_initialize() -> Result<()> {
        let m = Metrics::new(Registry::new())?;
        assert!(!m.is_initialized());

        let err = m.record_stale_remediation("hc1", "ns-a").unwrap_err();
        assert!(matches!(
            err,
            Error::UnregisteredInstrument {
                metric: OLD_REMEDIATION_CR
            }
        ));
        let err = m
            .mark_remediation_started("hc1", "ns-a", "reboot")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnregisteredInstrument {
                metric: ONGOING_REMEDIATION
            }
        ));
        assert!(m.mark_remediation_stopped("hc1", "ns-a", "reboot").is_err());
        // Refused observations must not leave series behind.
        assert_eq!(m.stale_remediations("hc1", "ns-a"), None);
        assert_eq!(m.ongoing_remediation("hc1", "ns-a", "reboot"), None);

        m.initialize()?;
        m.record_stale_remediation("hc1", "ns-a")?;
        assert_eq!(m.stale_remediations("hc1", "ns-a"), Some(1));
        Ok(())
    }

    #[test]
    fn initialize_twice() -> Result<()> {
        let m = initialized()?;
        let err = m.initialize().unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateRegistration {
                metric: OLD_REMEDIATION_CR
            }
        ));
        assert!(err.to_string().contains(OLD_REMEDIATION_CR));
        // Still usable after the refused second call.
        m.record_stale_remediation("hc1", "ns-a")?;
        Ok(())
    }

    #[test]
    fn colliding_metric_rolls_back() -> Result<()> {
        let registry = Registry::new();
        let foreign = prometheus::IntGauge::new(ONGOING_REMEDIATION, "something else")?;
        registry.register(Box::new(foreign))?;

        let m = Metrics::new(registry.clone())?;
        let err = m.initialize().unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateRegistration {
                metric: ONGOING_REMEDIATION
            }
        ));
        assert!(!m.is_initialized());
        assert!(
            !registry
                .gather()
                .iter()
                .any(|mf| mf.get_name() == OLD_REMEDIATION_CR)
        );

        // An identical counter is only accepted if ours was unregistered again.
        let counter = IntCounterVec::new(
            Opts::new(
                OLD_REMEDIATION_CR,
                "Number of old remediation CRs detected by NodeHealthChecks",
            ),
            &[LABEL_NAME, LABEL_NAMESPACE],
        )?;
        registry.register(Box::new(counter))?;
        Ok(())
    }

    #[test]
    fn same_name_with_const_label_is_duplicate() -> Result<()> {
        let registry = Registry::new();
        let foreign = prometheus::IntCounter::with_opts(
            Opts::new(OLD_REMEDIATION_CR, "other").const_label("team", "x"),
        )?;
        registry.register(Box::new(foreign))?;

        let m = Metrics::new(registry)?;
        let err = m.initialize().unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateRegistration {
                metric: OLD_REMEDIATION_CR
            }
        ));
        assert!(!m.is_initialized());
        Ok(())
    }

    #[test]
    fn separate_registries_are_isolated() -> Result<()> {
        let a = initialized()?;
        let b = initialized()?;
        a.record_stale_remediation("hc1", "ns-a")?;
        assert_eq!(a.stale_remediations("hc1", "ns-a"), Some(1));
        assert_eq!(b.stale_remediations("hc1", "ns-a"), None);
        Ok(())
    }

    #[test]
    fn counter_is_monotonic() -> Result<()> {
        let m = initialized()?;
        for want in 1..=5 {
            m.record_stale_remediation("hc1", "ns-a")?;
            assert_eq!(m.stale_remediations("hc1", "ns-a"), Some(want));
        }
        Ok(())
    }

    #[test]
    fn counter_labels_are_isolated() -> Result<()> {
        let m = initialized()?;
        m.record_stale_remediation("a", "ns1")?;
        m.record_stale_remediation("a", "ns1")?;
        m.record_stale_remediation("b", "ns1")?;

        assert_eq!(m.stale_remediations("a", "ns1"), Some(2));
        assert_eq!(m.stale_remediations("b", "ns1"), Some(1));
        assert_eq!(m.stale_remediations("a", "ns2"), None);
        Ok(())
    }

    #[test]
    fn start_is_idempotent() -> Result<()> {
        let m = initialized()?;
        m.mark_remediation_started("hc1", "ns-a", "reboot")?;
        m.mark_remediation_started("hc1", "ns-a", "reboot")?;
        assert_eq!(m.ongoing_remediation("hc1", "ns-a", "reboot"), Some(1));
        Ok(())
    }

    #[test]
    fn start_then_stop() -> Result<()> {
        let m = initialized()?;
        let (name, ns, kind) = ("node-1", "default", "poweroff-remediation");
        assert_eq!(m.ongoing_remediation(name, ns, kind), None);
        m.mark_remediation_started(name, ns, kind)?;
        assert_eq!(m.ongoing_remediation(name, ns, kind), Some(1));
        m.mark_remediation_stopped(name, ns, kind)?;
        assert_eq!(m.ongoing_remediation(name, ns, kind), Some(0));
        Ok(())
    }

    #[test]
    fn stop_without_start() -> Result<()> {
        let m = initialized()?;
        m.mark_remediation_stopped("hc1", "ns-a", "reboot")?;
        assert_eq!(m.ongoing_remediation("hc1", "ns-a", "reboot"), Some(0));
        assert_eq!(m.ongoing_remediation("hc1", "ns-a", "poweroff"), None);
        Ok(())
    }

    #[test]
    fn remediation_kinds_are_isolated() -> Result<()> {
        let m = initialized()?;
        m.mark_remediation_started("hc1", "ns-a", "reboot")?;
        m.mark_remediation_started("hc1", "ns-a", "poweroff")?;
        m.mark_remediation_stopped("hc1", "ns-a", "reboot")?;
        assert_eq!(m.ongoing_remediation("hc1", "ns-a", "reboot"), Some(0));
        assert_eq!(m.ongoing_remediation("hc1", "ns-a", "poweroff"), Some(1));
        Ok(())
    }

    #[test]
    fn empty_labels_are_accepted() -> Result<()> {
        let m = initialized()?;
        m.record_stale_remediation("", "")?;
        m.mark_remediation_started("", "", "")?;
        assert_eq!(m.stale_remediations("", ""), Some(1));
        assert_eq!(m.ongoing_remediation("", "", ""), Some(1));
        Ok(())
    }
}
