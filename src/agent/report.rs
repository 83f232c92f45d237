use crate::auth::Authenticator;
use crate::metrics::{MetricRecord, MetricSet, POLL_COUNT};

/// Build the records published for one report tick: one gauge record per
/// gauge and a single `PollCount` counter record carrying the current total.
pub fn build_batch(metrics: &MetricSet, authenticator: &Authenticator) -> Vec<MetricRecord> {
    let mut batch: Vec<MetricRecord> = metrics
        .gauges()
        .map(|(name, value)| MetricRecord::gauge(name, value))
        .collect();

    batch.push(MetricRecord::counter(
        POLL_COUNT,
        metrics.get_counter(POLL_COUNT).unwrap_or(0),
    ));

    for record in &mut batch {
        authenticator.sign(record);
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_contents() {
        let mut metrics = MetricSet::new();
        metrics.set_gauge("Alloc", 1.0);
        metrics.set_gauge("Sys", 2.0);
        metrics.set_counter(POLL_COUNT, 7);
        metrics.set_counter("Other", 3);

        let batch = build_batch(&metrics, &Authenticator::default());
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|r| r.hash.is_empty()));

        let poll = batch.last().unwrap();
        assert_eq!(poll.id, POLL_COUNT);
        assert_eq!(poll.delta, Some(7));
        assert_eq!(poll.value, None);
    }

    #[test]
    fn test_empty_set_still_reports_poll_count() {
        let batch = build_batch(&MetricSet::new(), &Authenticator::default());
        assert_eq!(batch, vec![MetricRecord::counter(POLL_COUNT, 0)]);
    }

    #[test]
    fn test_batch_is_signed_with_key() {
        let mut metrics = MetricSet::new();
        metrics.set_gauge("Alloc", 1.0);
        let auth = Authenticator::new(Some("secret"));

        let batch = build_batch(&metrics, &auth);
        assert!(batch.iter().all(|r| !r.hash.is_empty() && auth.verify_tag(r)));
    }
}
