pub mod cpuidle;
pub mod heater;
pub mod phase;
pub mod pps;
pub mod pwm;
pub mod rt;
pub mod sensor;
pub mod tracking;
