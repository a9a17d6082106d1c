use chat_stress::prelude::*;

/// Exit code when `--strict-thresholds` is set and a threshold failed.
const THRESHOLDS_FAILED: i32 = 99;

#[tokio::main]
async fn main() {
    let stress_attack = match StressAttack::initialize() {
        Ok(stress_attack) => stress_attack,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let strict_thresholds = stress_attack.configuration().strict_thresholds;

    match stress_attack.execute().await {
        Ok(metrics) => {
            if strict_thresholds && !metrics.thresholds.passed() {
                eprintln!(
                    "{} threshold(s) failed",
                    metrics.thresholds.failed().len()
                );
                std::process::exit(THRESHOLDS_FAILED);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
