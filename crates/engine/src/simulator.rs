//! Bar-by-bar backtest runner
//!
//! Long-only, all-in: a Buy opens a position with the whole equity at the
//! bar's close, a Sell closes it. An open position is marked to market every
//! bar and is still open (unrealized) at the end of the window.

use std::sync::Arc;
use tracing::debug;

use crate::backtest::{BacktestError, BacktestReport, BacktestRequest, BacktestRunner};
use crate::indicators::build_generator;
use crate::market_data::MarketDataStore;
use crate::types::{EquityPoint, Kline, Signal};

const DEFAULT_INITIAL_CAPITAL: f64 = 10_000.0;

/// Per-side fee as a fraction of notional
const DEFAULT_FEE_RATE: f64 = 0.001;

pub struct BarBacktester {
    market: Arc<MarketDataStore>,
    initial_capital: f64,
    fee_rate: f64,
}

impl BarBacktester {
    pub fn new(market: Arc<MarketDataStore>) -> Self {
        Self {
            market,
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            fee_rate: DEFAULT_FEE_RATE,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate.max(0.0);
        self
    }

    fn run_bars(
        &self,
        klines: &[Kline],
        mut on_bar: impl FnMut(&Kline) -> Signal,
    ) -> BacktestReport {
        let mut cash = self.initial_capital;
        let mut units = 0.0_f64;
        let mut peak = self.initial_capital;
        let mut max_drawdown = 0.0_f64;
        let mut trades = 0usize;
        let mut equity_curve = Vec::with_capacity(klines.len());

        for kline in klines {
            let price = kline.close_f64();
            let signal = on_bar(kline);

            if price > 0.0 {
                match signal {
                    Signal::Buy if units == 0.0 => {
                        units = cash * (1.0 - self.fee_rate) / price;
                        cash = 0.0;
                        trades += 1;
                    }
                    Signal::Sell if units > 0.0 => {
                        cash = units * price * (1.0 - self.fee_rate);
                        units = 0.0;
                    }
                    _ => {}
                }
            }

            let equity = cash + units * price;
            equity_curve.push(EquityPoint {
                time: kline.open_time,
                value: equity,
            });

            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - equity) / peak);
            }
        }

        let final_equity = equity_curve
            .last()
            .map(|p| p.value)
            .unwrap_or(self.initial_capital);

        debug!(
            bars = klines.len(),
            trades,
            final_equity,
            max_drawdown,
            "Simulation finished"
        );

        BacktestReport {
            total_return: final_equity / self.initial_capital - 1.0,
            max_drawdown,
            sharpe: None,
            equity_curve,
        }
    }
}

impl BacktestRunner for BarBacktester {
    fn simulate(&self, request: &BacktestRequest<'_>) -> Result<BacktestReport, BacktestError> {
        let mut generator = build_generator(request.strategy_id, request.params)?;

        let klines = self.market.slice(request.window);
        if klines.is_empty() {
            return Err(BacktestError::NoMarketData {
                symbol: request.window.symbol.clone(),
                timeframe: request.window.timeframe,
            });
        }

        Ok(self.run_bars(klines, |k| generator.on_bar(k)))
    }
}
