//! # strategy::indicators
//!
//! Rolling price window plus the handful of indicators the strategies use.
//! All functions return `None` when the window is too short.

use std::collections::VecDeque;

/// Bounded FIFO of recent prices; newest at the back.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    prices:   VecDeque<f64>,
    capacity: usize,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, price: f64) {
        if self.prices.len() >= self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    /// At least `n` prices seen.
    #[inline]
    pub fn holds(&self, n: usize) -> bool {
        self.prices.len() >= n
    }

    #[inline]
    pub fn last(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    /// The newest `n` prices, oldest first.
    pub fn tail(&self, n: usize) -> Option<Vec<f64>> {
        if n == 0 || self.prices.len() < n {
            return None;
        }
        Some(self.prices.iter().skip(self.prices.len() - n).copied().collect())
    }

    /// Latest price minus the price `periods` entries back (the latest counts as one).
    pub fn momentum(&self, periods: usize) -> Option<f64> {
        let prices = self.tail(periods)?;
        Some(prices[prices.len() - 1] - prices[0])
    }

    pub fn sma(&self, period: usize) -> Option<f64> {
        let prices = self.tail(period)?;
        Some(prices.iter().sum::<f64>() / period as f64)
    }

    pub fn rsi(&self, period: usize) -> Option<f64> {
        rsi(&self.tail(period + 1)?)
    }

    /// Sample standard deviation of simple returns over the newest `n` prices.
    pub fn volatility(&self, n: usize) -> Option<f64> {
        volatility(&self.tail(n)?)
    }
}

/// Simple-average RSI over `prices.len() - 1` changes.
pub fn rsi(prices: &[f64]) -> Option<f64> {
    if prices.len() < 2 {
        return None;
    }
    let period = (prices.len() - 1) as f64;
    let (gains, losses) = prices.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });
    let avg_gain = gains / period;
    let avg_loss = losses / period;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

pub fn volatility(prices: &[f64]) -> Option<f64> {
    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_window(prices: &[f64]) -> PriceWindow {
        let mut window = PriceWindow::new(50);
        for &p in prices {
            window.push(p);
        }
        window
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = PriceWindow::new(3);
        for p in [1.0, 2.0, 3.0, 4.0] {
            window.push(p);
        }
        assert!(window.holds(3) && !window.holds(4));
        assert_eq!(window.tail(3), Some(vec![2.0, 3.0, 4.0]));
        assert_eq!(window.tail(4), None);
    }

    #[test]
    fn test_momentum_and_sma() {
        let window = make_window(&[100.0, 101.0, 103.0, 106.0, 110.0]);
        assert_eq!(window.momentum(5), Some(10.0));
        assert_eq!(window.momentum(2), Some(4.0));
        assert_eq!(window.sma(2), Some(108.0));
        assert_eq!(window.sma(6), None);
    }

    #[test]
    fn test_rsi_bounds() {
        assert_eq!(rsi(&[1.0, 2.0, 3.0]), Some(100.0));
        let falling = rsi(&[3.0, 2.0, 1.0]).unwrap();
        assert!(falling.abs() < 1e-9);
        // Two gains of 2, two losses of 1 → RS = 2 → RSI ≈ 66.7
        let mixed = rsi(&[10.0, 12.0, 11.0, 13.0, 12.0]).unwrap();
        assert!((mixed - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_volatility_of_flat_series_is_zero() {
        assert_eq!(volatility(&[5.0, 5.0, 5.0]), Some(0.0));
        assert_eq!(volatility(&[5.0, 6.0]), None);
        assert!(volatility(&[100.0, 110.0, 99.0, 108.9]).unwrap() > 0.05);
    }
}
