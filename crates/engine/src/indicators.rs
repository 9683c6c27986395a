//! Signal generators for the built-in strategy families
//!
//! Each generator consumes klines bar by bar and emits Buy/Sell/Hold. They
//! are stateful; `reset` rewinds one to its freshly-built state so a single
//! instance can be replayed over another window.

use ta::indicators::{
    BollingerBands, MovingAverageConvergenceDivergence, RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::{Next, Reset};

use crate::backtest::BacktestError;
use crate::params::Individual;
use crate::strategies::{BOLLINGER_REVERSION, DUAL_MA, MACD_TREND, RSI_REVERSION};
use crate::types::{Kline, Signal};

/// Bar-by-bar signal generation
pub trait SignalGenerator: Send {
    fn name(&self) -> &str;
    fn on_bar(&mut self, kline: &Kline) -> Signal;
    fn reset(&mut self);
}

fn invalid(indicator: &str, e: ta::errors::TaError) -> BacktestError {
    BacktestError::InvalidParameters(format!("{indicator}: {e:?}"))
}

// ============================================================================
// 1. Dual SMA crossover
// ============================================================================

pub struct SmaCrossoverGenerator {
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    fast_period: usize,
    slow_period: usize,
    prev_fast: f64,
    prev_slow: f64,
    bars_seen: usize,
}

impl SmaCrossoverGenerator {
    pub fn new(fast_period: usize, slow_period: usize) -> Result<Self, BacktestError> {
        Ok(Self {
            fast: SimpleMovingAverage::new(fast_period).map_err(|e| invalid("fast SMA", e))?,
            slow: SimpleMovingAverage::new(slow_period).map_err(|e| invalid("slow SMA", e))?,
            fast_period,
            slow_period,
            prev_fast: 0.0,
            prev_slow: 0.0,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for SmaCrossoverGenerator {
    fn name(&self) -> &str {
        "SMACrossover"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = kline.close_f64();
        let fast = self.fast.next(close);
        let slow = self.slow.next(close);
        self.bars_seen += 1;

        let warmed_up = self.bars_seen > self.fast_period.max(self.slow_period);
        let signal = if warmed_up && self.prev_fast <= self.prev_slow && fast > slow {
            Signal::Buy
        } else if warmed_up && self.prev_fast >= self.prev_slow && fast < slow {
            Signal::Sell
        } else {
            Signal::Hold
        };

        self.prev_fast = fast;
        self.prev_slow = slow;
        signal
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.prev_fast = 0.0;
        self.prev_slow = 0.0;
        self.bars_seen = 0;
    }
}

// ============================================================================
// 2. RSI reversion
// ============================================================================

pub struct RsiReversionGenerator {
    rsi: RelativeStrengthIndex,
    period: usize,
    oversold: f64,
    overbought: f64,
    bars_seen: usize,
}

impl RsiReversionGenerator {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Result<Self, BacktestError> {
        if oversold >= overbought {
            return Err(BacktestError::InvalidParameters(format!(
                "oversold {oversold} must be below overbought {overbought}"
            )));
        }
        Ok(Self {
            rsi: RelativeStrengthIndex::new(period).map_err(|e| invalid("RSI", e))?,
            period,
            oversold,
            overbought,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for RsiReversionGenerator {
    fn name(&self) -> &str {
        "RSIReversion"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let value = self.rsi.next(kline.close_f64());
        self.bars_seen += 1;

        if self.bars_seen <= self.period {
            Signal::Hold
        } else if value < self.oversold {
            Signal::Buy
        } else if value > self.overbought {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn reset(&mut self) {
        self.rsi.reset();
        self.bars_seen = 0;
    }
}

// ============================================================================
// 3. Bollinger reversion
// ============================================================================

/// Buys a close below the lower band, exits once price is back at the mean
pub struct BollingerReversionGenerator {
    bb: BollingerBands,
    period: usize,
    bars_seen: usize,
}

impl BollingerReversionGenerator {
    pub fn new(period: usize, multiplier: f64) -> Result<Self, BacktestError> {
        Ok(Self {
            bb: BollingerBands::new(period, multiplier).map_err(|e| invalid("Bollinger", e))?,
            period,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for BollingerReversionGenerator {
    fn name(&self) -> &str {
        "BollingerReversion"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = kline.close_f64();
        let bands = self.bb.next(close);
        self.bars_seen += 1;

        if self.bars_seen < self.period || bands.upper - bands.lower <= 0.0 {
            return Signal::Hold;
        }

        if close < bands.lower {
            Signal::Buy
        } else if close >= bands.average {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn reset(&mut self) {
        self.bb.reset();
        self.bars_seen = 0;
    }
}

// ============================================================================
// 4. MACD trend
// ============================================================================

/// Trades histogram sign changes
pub struct MacdTrendGenerator {
    macd: MovingAverageConvergenceDivergence,
    slow: usize,
    prev_histogram: f64,
    bars_seen: usize,
}

impl MacdTrendGenerator {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self, BacktestError> {
        Ok(Self {
            macd: MovingAverageConvergenceDivergence::new(fast, slow, signal)
                .map_err(|e| invalid("MACD", e))?,
            slow,
            prev_histogram: 0.0,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for MacdTrendGenerator {
    fn name(&self) -> &str {
        "MACDTrend"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let histogram = self.macd.next(kline.close_f64()).histogram;
        self.bars_seen += 1;

        let warmed_up = self.bars_seen > self.slow;
        let signal = if warmed_up && self.prev_histogram <= 0.0 && histogram > 0.0 {
            Signal::Buy
        } else if warmed_up && self.prev_histogram >= 0.0 && histogram < 0.0 {
            Signal::Sell
        } else {
            Signal::Hold
        };

        self.prev_histogram = histogram;
        signal
    }

    fn reset(&mut self) {
        self.macd.reset();
        self.prev_histogram = 0.0;
        self.bars_seen = 0;
    }
}

// ============================================================================
// Factory
// ============================================================================

fn period(strategy: &str, params: &Individual, name: &str) -> Result<usize, BacktestError> {
    params
        .get_usize(name)
        .ok_or_else(|| BacktestError::MissingParameter {
            strategy: strategy.to_string(),
            param: name.to_string(),
        })
}

fn real(strategy: &str, params: &Individual, name: &str) -> Result<f64, BacktestError> {
    params
        .get_f64(name)
        .ok_or_else(|| BacktestError::MissingParameter {
            strategy: strategy.to_string(),
            param: name.to_string(),
        })
}

/// Build the generator for a strategy family from an individual's genes
pub fn build_generator(
    strategy_id: &str,
    params: &Individual,
) -> Result<Box<dyn SignalGenerator>, BacktestError> {
    let generator: Box<dyn SignalGenerator> = match strategy_id {
        DUAL_MA => Box::new(SmaCrossoverGenerator::new(
            period(strategy_id, params, "fast")?,
            period(strategy_id, params, "slow")?,
        )?),
        RSI_REVERSION => Box::new(RsiReversionGenerator::new(
            period(strategy_id, params, "period")?,
            real(strategy_id, params, "oversold")?,
            real(strategy_id, params, "overbought")?,
        )?),
        BOLLINGER_REVERSION => Box::new(BollingerReversionGenerator::new(
            period(strategy_id, params, "period")?,
            real(strategy_id, params, "multiplier")?,
        )?),
        MACD_TREND => Box::new(MacdTrendGenerator::new(
            period(strategy_id, params, "fast")?,
            period(strategy_id, params, "slow")?,
            period(strategy_id, params, "signal")?,
        )?),
        other => return Err(BacktestError::UnknownStrategy(other.to_string())),
    };
    Ok(generator)
}
