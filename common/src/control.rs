use thiserror::Error;

use crate::{
    config::ControlConfig,
    ringlog::SharedLog,
    types::{ControlState, ProbeSample},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("gpio {pin}: {reason}")]
    Gpio { pin: &'static str, reason: String },
    #[error("adc: {0}")]
    Adc(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectrodeDrive {
    Off,
    On(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectrodeLevels {
    pub wat_minus: bool,
    pub wat_plus: bool,
    pub cl_minus: bool,
    pub cl_plus: bool,
}

impl ElectrodeDrive {
    pub fn levels(self) -> ElectrodeLevels {
        match self {
            Self::Off => ElectrodeLevels {
                wat_minus: false,
                wat_plus: false,
                cl_minus: false,
                cl_plus: false,
            },
            Self::On(polarity) => ElectrodeLevels {
                wat_minus: polarity,
                wat_plus: !polarity,
                cl_minus: polarity,
                cl_plus: !polarity,
            },
        }
    }
}

pub trait CellIo {
    fn flow_ok(&mut self) -> Result<bool, IoError>;
    fn set_power(&mut self, on: bool) -> Result<(), IoError>;
    fn set_fan(&mut self, on: bool) -> Result<(), IoError>;
    fn set_electrodes(&mut self, drive: ElectrodeDrive) -> Result<(), IoError>;
    fn sample_probe(&mut self) -> Result<ProbeSample, IoError>;
}

#[derive(Debug, Clone)]
pub struct CellController {
    config: ControlConfig,
    state: ControlState,
    flow_pending: bool,
    flow_read_failing: bool,
    last_flip_ms: u64,
}

impl CellController {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            state: ControlState::default(),
            flow_pending: false,
            flow_read_failing: false,
            last_flip_ms: 0,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn start(&mut self, io: &mut impl CellIo, log: &SharedLog) -> ControlState {
        self.switch(false, io);

        match io.flow_ok() {
            Ok(true) => {
                self.state.flow_ok = true;
                log.record("Flow Ok on startup");
            }
            Ok(false) => log.record("Low flow detected at startup"),
            Err(err) => {
                log::warn!("flow sensor read failed at startup: {err}");
                log.record("Low flow detected at startup");
            }
        }
        self.state
    }

    pub fn tick(
        &mut self,
        now_ms: u64,
        active: bool,
        flow_changed: bool,
        io: &mut impl CellIo,
        log: &SharedLog,
    ) -> ControlState {
        self.flow_pending |= flow_changed;

        if !active {
            if self.state.running {
                self.state.running = false;
                self.switch(false, io);
                log.record("Schedule inactive, cell off");
            }
            return self.state;
        }

        if !self.state.running {
            self.state.running = true;
            self.flow_pending = true;
            self.last_flip_ms = now_ms;
            log.record("Schedule active, cell on");
        }

        if self.flow_pending {
            self.flow_pending = false;
            let reading = io.flow_ok();
            self.apply_flow(reading, io, log);
        } else if self.state.flow_ok
            && now_ms.saturating_sub(self.last_flip_ms) >= self.config.polarity_period_ms
        {
            self.last_flip_ms = now_ms;
            // a missed flow edge must not keep the cell energized
            match io.flow_ok() {
                Ok(true) => self.flip_polarity(io, log),
                reading => self.apply_flow(reading, io, log),
            }
        }

        self.state
    }

    fn apply_flow(
        &mut self,
        reading: Result<bool, IoError>,
        io: &mut impl CellIo,
        log: &SharedLog,
    ) {
        match reading {
            Ok(ok) => {
                self.flow_read_failing = false;
                log.record(if ok { "Flow Ok" } else { "Low flow detected" });
                self.state.flow_ok = ok;
                self.switch(ok, io);
            }
            Err(err) => {
                // retried every tick, reported once
                self.flow_pending = true;
                if self.flow_read_failing {
                    return;
                }
                self.flow_read_failing = true;
                log::warn!("flow sensor read failed, treating as low flow: {err}");
                if self.state.flow_ok {
                    log.record("Low flow detected");
                }
                self.state.flow_ok = false;
                self.switch(false, io);
            }
        }
    }

    fn flip_polarity(&mut self, io: &mut impl CellIo, log: &SharedLog) {
        self.state.polarity = !self.state.polarity;
        self.state.cycle_count = self.state.cycle_count.wrapping_add(1);
        report(io.set_electrodes(ElectrodeDrive::On(self.state.polarity)));

        match io.sample_probe() {
            Ok(sample) => log.record(format!(
                "Polarity {}, raw {}, {} mV",
                u8::from(self.state.polarity),
                sample.raw,
                sample.millivolts
            )),
            Err(err) => log.record(format!(
                "Polarity {}, probe unavailable: {err}",
                u8::from(self.state.polarity)
            )),
        }
    }

    fn switch(&self, on: bool, io: &mut impl CellIo) {
        report(io.set_power(on));
        report(io.set_fan(on));
        let drive = if on {
            ElectrodeDrive::On(self.state.polarity)
        } else {
            ElectrodeDrive::Off
        };
        report(io.set_electrodes(drive));
    }
}

fn report(result: Result<(), IoError>) {
    if let Err(err) = result {
        log::error!("output write failed: {err}");
    }
}
