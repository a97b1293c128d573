//! Interface de linha de comando do genrelay baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status, price, demo)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;

use crate::pricing::Capability;

/// genrelay: orquestração de jobs de IA generativa cobrados em créditos.
#[derive(Debug, Parser)]
#[command(name = "genrelay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./genrelay.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Capacidade aceita pela CLI, mapeada para [`Capability`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CapabilityArg {
    /// Geração de imagem.
    Image,
    /// Geração de vídeo (cobrada por segundo).
    Video,
    /// Geração de modelo 3D.
    #[value(name = "model3d", alias = "3d")]
    Model3d,
    /// Geração de música (cobrada por segundo).
    Music,
    /// Treinamento de LoRA (cobrado por passo).
    Training,
}

impl From<CapabilityArg> for Capability {
    fn from(arg: CapabilityArg) -> Self {
        match arg {
            CapabilityArg::Image => Capability::Image,
            CapabilityArg::Video => Capability::Video,
            CapabilityArg::Model3d => Capability::Model3d,
            CapabilityArg::Music => Capability::Music,
            CapabilityArg::Training => Capability::Training,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete um job ao provedor e aguarda o artefato.
    Run {
        /// Capacidade cobrada pelo job.
        capability: CapabilityArg,

        /// Caminho do modelo no provedor (ex.: fal-ai/veo3).
        #[arg(long)]
        endpoint: String,

        /// Parâmetros do job em JSON.
        #[arg(long, default_value = "{}")]
        params: String,

        /// Identificador do ator cobrado.
        #[arg(long, default_value = "local")]
        actor: String,

        /// Créditos concedidos ao ator antes do job (ledger em memória).
        #[arg(long, default_value = "10")]
        grant: Decimal,
    },

    /// Consulta o status de um job uma única vez.
    Status {
        /// Id do job devolvido pelo provedor.
        job_id: String,

        /// Caminho do modelo usado na submissão.
        #[arg(long)]
        endpoint: String,
    },

    /// Mostra o preço de um job sem submetê-lo.
    Price {
        capability: CapabilityArg,

        /// Parâmetros do job em JSON.
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Executa a demonstração embutida contra um provedor simulado.
    Demo,
}
