//! Engine-side building blocks for the markroute policy-routing daemon:
//! runtime configuration, compiled rule sets, route objects, the interval
//! index the route table lives in, resolver record parsing, and the country
//! prefix source.

pub mod config;
pub mod interval;
pub mod logging;
pub mod prefix;
pub mod record;
pub mod route;
pub mod rules;
