//! Rendering of worker status reports.
//!
//! Positive info levels produce a bordered ASCII table, negative levels a
//! JSON array; |level| >= 2 adds per-CPU detail. Rendering is read-only
//! over the server table: any worker whose last command succeeded
//! contributes a row.

use comfy_table::{presets::ASCII_FULL, ContentArrangement, Table};
use serde_json::json;

use crate::distrib::state::WorkerInfoSnapshot;
use crate::distrib::DistribCore;
use crate::worker::WorkerMode;

/// CPU totals summed over the reporting workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoAggregates {
    /// Worker count per mode byte (index = mode).
    pub workers_per_mode: Vec<u32>,
    pub cpu_total: u32,
    pub cpu_idle: u32,
    pub cpu_busy: u32,
    /// Number of workers that contributed a row.
    pub reporting: u32,
}

/// Width of the per-thread bar: one cell per CPU, capped.
const THREAD_BAR_CELLS: usize = 32;
/// Width of the CPU-usage bar.
const PERCENT_BAR_CELLS: usize = 20;

impl DistribCore {
    /// Render the collected worker info. Returns the printable text and the
    /// CPU aggregates (used by wait-idle).
    pub fn render_info(&self, info_level: i32) -> (String, InfoAggregates) {
        let mut aggregates = InfoAggregates::default();
        let mut table = Table::new();
        if info_level >= 1 {
            table.load_preset(ASCII_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec![
                "Worker",
                "Mode",
                "Threads +Busy -Idle *Disabled",
                "% CPU +Worker *Local",
            ]);
        }
        let mut json_rows = Vec::new();

        let servers = self.servers.lock().expect("server table poisoned");
        for server in servers.iter() {
            if !server.control_enabled {
                continue;
            }
            let inner = server.lock();
            if !inner.control_success {
                continue;
            }
            let info = match &inner.info {
                Some(info) => info.clone(),
                None => continue,
            };
            drop(inner);

            aggregates.reporting += 1;
            let mode_index = info.mode as usize;
            if aggregates.workers_per_mode.len() <= mode_index {
                aggregates.workers_per_mode.resize(mode_index + 1, 0);
            }
            aggregates.workers_per_mode[mode_index] += 1;
            aggregates.cpu_total += info.num_cpus_total as u32;
            aggregates.cpu_idle += info.num_cpus_idle as u32;
            aggregates.cpu_busy += info.num_cpus_busy as u32;

            let mode_str = WorkerMode::name_for_wire(info.mode);

            if info_level >= 1 {
                table.add_row(vec![
                    server.name().to_string(),
                    mode_str.to_string(),
                    thread_bar(&info, info_level >= 2),
                    percent_bar(&info),
                ]);
                if info_level >= 2 {
                    for (i, slot) in info.details.iter().enumerate() {
                        table.add_row(vec![
                            format!("  cpu {}", i),
                            slot.host_name.clone(),
                            slot.job_status.clone(),
                            String::new(),
                        ]);
                    }
                }
            } else if info_level <= -1 {
                let mut row = json!({
                    "worker": server.name(),
                    "mode": mode_str,
                    "cpu_total": info.num_cpus_total,
                    "cpu_busy": info.num_cpus_busy,
                    "cpu_idle": info.num_cpus_idle,
                    "cpu_usage_total": info.cpu_usage_total,
                    "cpu_usage_fastbuild": info.cpu_usage_self,
                });
                if info_level <= -2 {
                    row["jobs"] = info
                        .details
                        .iter()
                        .map(|slot| {
                            json!({
                                "client": slot.host_name,
                                "status": slot.job_status,
                            })
                        })
                        .collect();
                }
                json_rows.push(row);
            }
        }
        drop(servers);

        let text = if info_level >= 1 {
            format!("{}\n", table)
        } else if info_level <= -1 {
            match serde_json::to_string_pretty(&json_rows) {
                Ok(json) => format!("{}\n", json),
                Err(_) => String::new(),
            }
        } else {
            String::new()
        };

        (text, aggregates)
    }
}

/// One cell per CPU: '+' busy, '-' idle, '*' disabled. Falls back to the
/// aggregate counts when per-CPU details were not reported.
fn thread_bar(info: &WorkerInfoSnapshot, want_details: bool) -> String {
    let cells = (info.num_cpus_total as usize).min(THREAD_BAR_CELLS);
    let mut bar = String::with_capacity(cells);
    if want_details && info.details.len() >= cells {
        for slot in info.details.iter().take(cells) {
            bar.push(if slot.busy {
                '+'
            } else if slot.idle {
                '-'
            } else {
                '*'
            });
        }
    } else {
        for i in 0..cells {
            bar.push(if i < info.num_cpus_busy as usize {
                '+'
            } else if i < (info.num_cpus_busy + info.num_cpus_idle) as usize {
                '-'
            } else {
                '*'
            });
        }
    }
    bar
}

/// Usage bar over PERCENT_BAR_CELLS cells. Cell i covers the band centered
/// at (i + 0.5) * 100 / cells percent: '+' when the center is below the
/// worker's own build usage, '-' when below the remaining non-build
/// headroom, '*' otherwise.
fn percent_bar(info: &WorkerInfoSnapshot) -> String {
    let mut bar = String::with_capacity(PERCENT_BAR_CELLS);
    for i in 0..PERCENT_BAR_CELLS {
        let center = (i as f32 + 0.5) * 100.0 / PERCENT_BAR_CELLS as f32;
        bar.push(if center < info.cpu_usage_self {
            '+'
        } else if center < 100.0 - (info.cpu_usage_total - info.cpu_usage_self) {
            '-'
        } else {
            '*'
        });
    }
    bar
}
