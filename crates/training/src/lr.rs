/// Resolved learning rate plus the quantities reported alongside it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedLearningRate {
    /// The learning rate the optimizer will actually use.
    pub lr: f64,
    /// Nominal base-256 equivalent of `lr` (for log correlation).
    pub base_lr: f64,
    pub effective_batch_size: usize,
    pub accum_iter: usize,
}

/// Linear-scaling rule: when no explicit learning rate is configured, the
/// realized rate is `blr * effective_batch_size / 256`, keeping it invariant
/// to batch-size and world-size changes. An explicit `lr` wins unchanged.
/// Runs exactly once, before optimizer construction.
pub fn resolve_learning_rate(
    batch_size: usize,
    accum_iter: usize,
    world_size: usize,
    lr: Option<f64>,
    blr: f64,
) -> ResolvedLearningRate {
    let effective_batch_size = batch_size * accum_iter * world_size;
    let lr = match lr {
        Some(explicit) => explicit,
        None => blr * effective_batch_size as f64 / 256.0,
    };
    ResolvedLearningRate {
        lr,
        base_lr: lr * 256.0 / effective_batch_size as f64,
        effective_batch_size,
        accum_iter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_linear_scaling_when_lr_unset() {
        let resolved = resolve_learning_rate(32, 2, 4, None, 1e-3);
        assert_eq!(resolved.effective_batch_size, 256);
        assert!((resolved.lr - 1e-3).abs() < 1e-12);
        assert!((resolved.base_lr - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn doubling_any_factor_doubles_the_rate() {
        let base = resolve_learning_rate(16, 2, 2, None, 1e-3).lr;
        assert!((resolve_learning_rate(32, 2, 2, None, 1e-3).lr - 2.0 * base).abs() < 1e-12);
        assert!((resolve_learning_rate(16, 4, 2, None, 1e-3).lr - 2.0 * base).abs() < 1e-12);
        assert!((resolve_learning_rate(16, 2, 4, None, 1e-3).lr - 2.0 * base).abs() < 1e-12);
    }

    #[test]
    fn explicit_lr_wins_regardless_of_batch_geometry() {
        for (batch, accum, world) in [(8, 1, 1), (64, 4, 8), (256, 1, 2)] {
            let resolved = resolve_learning_rate(batch, accum, world, Some(5e-4), 1e-3);
            assert_eq!(resolved.lr, 5e-4);
        }
    }
}
