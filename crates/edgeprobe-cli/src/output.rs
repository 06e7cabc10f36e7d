//! Plain-text rendering for CLI output

use edgeprobe_core::{IpRange, Provider, TestResult};

pub fn print_providers(providers: &[Provider]) {
    if providers.is_empty() {
        println!("no providers");
        return;
    }
    println!("{:<6} {:<20} {}", "ID", "NAME", "API URL");
    for provider in providers {
        println!(
            "{:<6} {:<20} {}",
            provider.id,
            provider.name,
            provider.api_url.as_deref().unwrap_or("-")
        );
    }
}

pub fn print_ranges(ranges: &[IpRange]) {
    if ranges.is_empty() {
        println!("no ranges");
        return;
    }
    println!(
        "{:<6} {:<8} {:<40} {:<40} {}",
        "ID", "SOURCE", "START", "END", "CIDR"
    );
    for range in ranges {
        println!(
            "{:<6} {:<8} {:<40} {:<40} {}",
            range.id,
            range.source,
            range.start_ip,
            range.end_ip,
            range.cidr.as_deref().unwrap_or("-")
        );
    }
}

pub fn print_result(result: &TestResult) {
    println!("ip:             {}", result.ip);
    if let Some(avg) = result.avg_latency {
        println!("avg latency:    {:.2} ms", avg);
    }
    if let Some(std) = result.std_deviation {
        println!("std deviation:  {:.4} ms", std);
    }
    if let Some(loss) = result.packet_loss {
        println!("packet loss:    {:.2}", loss);
    }
    match result.download_speed {
        Some(speed) if speed >= 0.0 => println!("download speed: {:.2} MB/s", speed),
        Some(_) => println!("download speed: failed"),
        None => println!("download speed: untested"),
    }
    println!("test time:      {}", result.test_time.to_rfc3339());
}
