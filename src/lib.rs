// Library for tests to access modules

pub mod config;
pub mod convert;
pub mod lookup;
pub mod perfdata;
pub mod progress;
pub mod rrd;
pub mod scan;
pub mod whisper;
