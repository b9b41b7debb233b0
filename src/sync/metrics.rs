//! Network-wide aggregates computed from a broadcast's node list

use crate::protocol::NetworkNode;

/// Shannon entropy of the normalized absolute sync-error distribution
///
/// Zero for an empty list or when every node reports zero error.
pub fn network_entropy(nodes: &[NetworkNode]) -> f64 {
    let total: f64 = nodes
        .iter()
        .map(|n| n.sync_error.abs())
        .filter(|e| e.is_finite())
        .sum();
    if nodes.is_empty() || total <= 0.0 || !total.is_finite() {
        return 0.0;
    }

    nodes
        .iter()
        .map(|n| n.sync_error.abs())
        .filter(|e| e.is_finite() && *e > 0.0)
        .map(|e| {
            let p = e / total;
            -p * p.ln()
        })
        .sum()
}

/// `ln(mean playback rate) / mean latency`
///
/// Zero when the list is empty, mean latency is zero, or the mean rate is
/// not positive.
pub fn network_free_energy(nodes: &[NetworkNode]) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    let count = nodes.len() as f64;
    let mean_rate = nodes.iter().map(|n| n.playback_rate).sum::<f64>() / count;
    let mean_latency = nodes.iter().map(|n| n.latency).sum::<f64>() / count;

    if mean_latency == 0.0 || mean_rate <= 0.0 {
        return 0.0;
    }
    let free_energy = mean_rate.ln() / mean_latency;
    if free_energy.is_finite() {
        free_energy
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: &str, latency: f64, sync_error: f64, playback_rate: f64) -> NetworkNode {
        NetworkNode {
            id: id.to_string(),
            latency,
            sync_error,
            playback_rate,
            connection_type: Default::default(),
        }
    }

    #[test]
    fn test_uniform_entropy_is_log_n() {
        for n in 1..=8usize {
            let nodes: Vec<_> = (0..n).map(|i| node(&i.to_string(), 10.0, -0.2, 1.0)).collect();
            assert!((network_entropy(&nodes) - (n as f64).ln()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_dominant_node_entropy_is_zero() {
        let nodes = vec![
            node("a", 10.0, 0.7, 1.0),
            node("b", 10.0, 0.0, 1.0),
            node("c", 10.0, 0.0, 1.0),
        ];
        assert_eq!(network_entropy(&nodes), 0.0);
    }

    #[test]
    fn test_entropy_degenerate_inputs() {
        assert_eq!(network_entropy(&[]), 0.0);
        assert_eq!(network_entropy(&[node("a", 1.0, 0.0, 1.0), node("b", 1.0, 0.0, 1.0)]), 0.0);
    }

    #[test]
    fn test_free_energy_zero_latency_or_empty() {
        assert_eq!(network_free_energy(&[]), 0.0);
        assert_eq!(network_free_energy(&[node("a", 0.0, 0.1, 1.5)]), 0.0);
        assert_eq!(network_free_energy(&[node("a", 0.0, 0.1, 1.5), node("b", 0.0, 0.1, 0.9)]), 0.0);
    }

    #[test]
    fn test_free_energy_value() {
        let nodes = vec![node("a", 40.0, 0.0, 1.2), node("b", 60.0, 0.0, 1.0)];
        let expected = 1.1f64.ln() / 50.0;
        assert!((network_free_energy(&nodes) - expected).abs() < 1e-12);

        assert_eq!(network_free_energy(&[node("a", 50.0, 0.1, 1.0)]), 0.0);
    }

    proptest! {
        #[test]
        fn prop_entropy_within_log_n(errors in prop::collection::vec(-10.0f64..10.0, 1..32)) {
            let nodes: Vec<_> = errors
                .iter()
                .enumerate()
                .map(|(i, e)| node(&i.to_string(), 10.0, *e, 1.0))
                .collect();
            let entropy = network_entropy(&nodes);
            prop_assert!(entropy >= 0.0);
            prop_assert!(entropy <= (nodes.len() as f64).ln() + 1e-9);
        }
    }
}
