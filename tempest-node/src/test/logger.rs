use log::*;

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let current = std::thread::current();
            let msg = format!("{:>8} {}", format!("{}:", record.target()), record.args());

            if let Some(name) = current.name() {
                println!("{name:<24} {msg}");
            } else {
                println!("{msg}");
            }
        }
    }

    fn flush(&self) {}
}

/// Initialize the test logger. Add a call to the top of a test and run it
/// with `--nocapture` to see the node logs.
#[allow(dead_code)]
pub fn init(level: Level) {
    let logger = Logger { level };

    log::set_boxed_logger(Box::new(logger)).ok();
    log::set_max_level(level.to_level_filter());
}
