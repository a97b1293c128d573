//! Interface de terminal do genrelay: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! um job pago no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use rust_decimal::Decimal;

use crate::error::RelayError;
use crate::orchestrator::JobOutcome;
use crate::state_machine::{JobState, JobSummary};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner animado enquanto o job roda e mensagens coloridas para
/// sucesso (verde), falha (vermelho) e pendência (amarelo).
pub struct JobProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com a descrição do job.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        // O template é fixo; se falhar, o estilo padrão do spinner serve.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Finaliza o spinner e exibe o resultado do job.
    pub fn complete(&self, outcome: &JobOutcome) {
        self.pb.finish_and_clear();
        match outcome {
            JobOutcome::Completed {
                job_id,
                artifact,
                credits_deducted,
                remaining_credits,
                ..
            } => {
                println!(
                    "  {} Job {job_id} completed: {}",
                    self.green.apply_to("✓"),
                    artifact.primary()
                );
                for url in artifact.urls.iter().skip(1) {
                    println!("      {url}");
                }
                println!(
                    "    charged {} · remaining {}",
                    credits(*credits_deducted),
                    credits(*remaining_credits)
                );
            }
            JobOutcome::Pending { job_id, reason } => {
                println!(
                    "  {} Job {job_id} {reason}; credits held until it is reconciled",
                    self.yellow.apply_to("…")
                );
            }
        }
    }

    /// Finaliza o spinner e exibe a mensagem sanitizada do erro.
    pub fn failure(&self, error: &RelayError) {
        self.pb.finish_and_clear();
        println!("  {} {}", self.red.apply_to("✗"), error.user_message());
    }

    /// Imprime o resumo do job formatado em JSON com estilo colorido.
    pub fn print_summary(&self, summary: &JobSummary) {
        let style = match summary.state {
            JobState::Completed => &self.green,
            JobState::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Job Summary ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
    }
}

fn credits(amount: Decimal) -> String {
    format!("{} credits", amount.normalize())
}
