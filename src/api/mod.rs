use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

use crate::core::{
    Config, ConfigError, CrystallisationStrategy, DepletionSensitivityCell, DepletionSolveConfig,
    DepletionSolveResult, DrawdownOrder, MortgageOption, SensitivityCell, SimulationParams,
    SimulationResult, SolverError, best_depletion, best_strategy, depletion_strategies,
    load_config, run_depletion_sensitivity, run_matrix, run_sensitivity, run_simulation,
    solve_all, solve_depletion,
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker failed: {0}")]
    Worker(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Config(ConfigError::Json(_)) => StatusCode::BAD_REQUEST,
            AppError::Config(_) | AppError::Solver(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Output(_) | AppError::Io(_) | AppError::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCrystallisation {
    Gradual,
    Ufpls,
}

impl From<CliCrystallisation> for CrystallisationStrategy {
    fn from(value: CliCrystallisation) -> Self {
        match value {
            CliCrystallisation::Gradual => CrystallisationStrategy::Gradual,
            CliCrystallisation::Ufpls => CrystallisationStrategy::Ufpls,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliDrawdownOrder {
    SavingsFirst,
    PensionFirst,
    TaxOptimized,
    PensionToIsa,
    PensionToIsaProactive,
    PensionOnly,
    FillBasicRate,
    StatePensionBridge,
}

impl From<CliDrawdownOrder> for DrawdownOrder {
    fn from(value: CliDrawdownOrder) -> Self {
        match value {
            CliDrawdownOrder::SavingsFirst => DrawdownOrder::SavingsFirst,
            CliDrawdownOrder::PensionFirst => DrawdownOrder::PensionFirst,
            CliDrawdownOrder::TaxOptimized => DrawdownOrder::TaxOptimized,
            CliDrawdownOrder::PensionToIsa => DrawdownOrder::PensionToIsa,
            CliDrawdownOrder::PensionToIsaProactive => DrawdownOrder::PensionToIsaProactive,
            CliDrawdownOrder::PensionOnly => DrawdownOrder::PensionOnly,
            CliDrawdownOrder::FillBasicRate => DrawdownOrder::FillBasicRate,
            CliDrawdownOrder::StatePensionBridge => DrawdownOrder::StatePensionBridge,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliMortgageOption {
    Early,
    Normal,
    Extended,
    PclsPayoff,
}

impl From<CliMortgageOption> for MortgageOption {
    fn from(value: CliMortgageOption) -> Self {
        match value {
            CliMortgageOption::Early => MortgageOption::Early,
            CliMortgageOption::Normal => MortgageOption::Normal,
            CliMortgageOption::Extended => MortgageOption::Extended,
            CliMortgageOption::PclsPayoff => MortgageOption::PclsPayoff,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "drawdown",
    about = "UK retirement drawdown simulator (ISA + pension + state/DB pensions + mortgage)"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one strategy and print every simulated year.
    Simulate(SimulateArgs),
    /// Run every strategy combination and report the best.
    Matrix {
        #[arg(long)]
        config: PathBuf,
    },
    /// Find the highest monthly income that lasts until the target age.
    Depletion(DepletionArgs),
    /// Re-run the matrix (or the depletion solve) across a grid of growth rates.
    Sensitivity(SensitivityArgs),
    /// Serve the JSON API over HTTP.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, value_enum, default_value_t = CliCrystallisation::Gradual)]
    crystallisation: CliCrystallisation,
    #[arg(long, value_enum, default_value_t = CliDrawdownOrder::TaxOptimized)]
    order: CliDrawdownOrder,
    #[arg(long, value_enum, default_value_t = CliMortgageOption::Normal)]
    mortgage: CliMortgageOption,
    #[arg(long, help = "Apply Guyton-Klinger guardrails to the income requirement")]
    guardrails: bool,
    #[arg(long, default_value_t = 0, help = "Years to defer the state pension")]
    defer_years: u32,
}

impl SimulateArgs {
    fn params(&self, config: &Config) -> SimulationParams {
        SimulationParams {
            crystallisation: self.crystallisation.into(),
            drawdown_order: self.order.into(),
            mortgage_option: self.mortgage.into(),
            guardrails: self.guardrails,
            state_pension_defer_years: self.defer_years,
            maximize_couple_isa: config.strategy.maximize_couple_isa,
        }
    }
}

#[derive(Args, Debug)]
struct DepletionArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, help = "Age at which the pots may run dry; defaults to the config")]
    target_age: Option<u32>,
    #[arg(long, default_value_t = 100)]
    max_iterations: u32,
    #[arg(long, default_value_t = 1.0, help = "Convergence width in pounds per month")]
    tolerance: f64,
    #[arg(long, help = "Deplete the pensions by the target age and leave ISAs intact")]
    pension_only: bool,
}

impl DepletionArgs {
    fn solve_config(&self) -> DepletionSolveConfig {
        DepletionSolveConfig {
            target_age: self.target_age,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            pension_only: self.pension_only,
            ..DepletionSolveConfig::default()
        }
    }
}

#[derive(Args, Debug)]
struct SensitivityArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, help = "Sweep the depletion solve instead of the strategy matrix")]
    depletion: bool,
    #[arg(long, requires = "depletion", help = "With --depletion, keep ISAs intact")]
    pension_only: bool,
    #[arg(long, requires = "depletion")]
    target_age: Option<u32>,
}

impl SensitivityArgs {
    fn solve_config(&self) -> Option<DepletionSolveConfig> {
        self.depletion.then(|| DepletionSolveConfig {
            target_age: self.target_age,
            pension_only: self.pension_only,
            ..DepletionSolveConfig::default()
        })
    }
}

#[derive(Debug, Deserialize)]
struct SimulateRequest {
    config: Config,
    #[serde(default)]
    params: Option<SimulationParams>,
}

#[derive(Debug, Deserialize)]
struct MatrixRequest {
    config: Config,
}

#[derive(Debug, Deserialize)]
struct DepletionRequest {
    config: Config,
    #[serde(default)]
    solver: DepletionSolveConfig,
    /// Solve a single strategy instead of the whole matrix.
    #[serde(default)]
    params: Option<SimulationParams>,
}

#[derive(Debug, Deserialize)]
struct SensitivityRequest {
    config: Config,
    /// Present: sweep the depletion solve. Absent: sweep the strategy matrix.
    #[serde(default)]
    solver: Option<DepletionSolveConfig>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
enum SensitivityResponse {
    Matrix { cells: Vec<SensitivityCell> },
    Depletion { cells: Vec<DepletionSensitivityCell> },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MatrixResponse {
    best: Option<String>,
    results: Vec<SimulationResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DepletionFailure {
    strategy: String,
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DepletionResponse {
    best: Option<String>,
    results: Vec<DepletionSolveResult>,
    failures: Vec<DepletionFailure>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn parse_request<T: DeserializeOwned>(body: &str) -> Result<T, AppError> {
    serde_json::from_str(body).map_err(|e| AppError::Config(ConfigError::Json(e)))
}

fn simulate(config: &Config, params: Option<SimulationParams>) -> Result<SimulationResult, AppError> {
    config.validate()?;
    let params = params.unwrap_or_else(|| SimulationParams {
        maximize_couple_isa: config.strategy.maximize_couple_isa,
        ..SimulationParams::default()
    });
    Ok(run_simulation(config, &params))
}

fn matrix(config: &Config) -> Result<MatrixResponse, AppError> {
    config.validate()?;
    let results = run_matrix(config);
    let best = best_strategy(&results).map(|r| r.name.clone());
    Ok(MatrixResponse { best, results })
}

fn depletion(
    config: &Config,
    solve_config: &DepletionSolveConfig,
    params: Option<SimulationParams>,
) -> Result<DepletionResponse, AppError> {
    config.validate()?;
    if let Some(params) = params {
        let result = solve_depletion(config, &params, solve_config)?;
        return Ok(DepletionResponse {
            best: result.is_solved().then(|| result.result.name.clone()),
            results: vec![result],
            failures: Vec::new(),
        });
    }

    let strategies = depletion_strategies(config, solve_config);
    let mut results = Vec::with_capacity(strategies.len());
    let mut failures = Vec::new();
    for (params, outcome) in strategies.iter().zip(solve_all(config, &strategies, solve_config)) {
        match outcome {
            Ok(result) => results.push(result),
            // Invalid settings are shared by every strategy.
            Err(err @ SolverError::InvalidConfig(_)) => return Err(err.into()),
            Err(err) => failures.push(DepletionFailure {
                strategy: params.short_name(),
                error: err.to_string(),
            }),
        }
    }
    let best = best_depletion(&results).map(|r| r.result.name.clone());
    Ok(DepletionResponse {
        best,
        results,
        failures,
    })
}

fn sensitivity(
    config: &Config,
    solve_config: Option<&DepletionSolveConfig>,
) -> Result<SensitivityResponse, AppError> {
    config.validate()?;
    Ok(match solve_config {
        Some(solve_config) => SensitivityResponse::Depletion {
            cells: run_depletion_sensitivity(config, solve_config)?,
        },
        None => SensitivityResponse::Matrix {
            cells: run_sensitivity(config),
        },
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Command::Simulate(args) => {
            let config = load_config(&args.config)?;
            let params = args.params(&config);
            print_json(&simulate(&config, Some(params))?)
        }
        Command::Matrix { config } => {
            let config = load_config(&config)?;
            print_json(&matrix(&config)?)
        }
        Command::Depletion(args) => {
            let config = load_config(&args.config)?;
            print_json(&depletion(&config, &args.solve_config(), None)?)
        }
        Command::Sensitivity(args) => {
            let config = load_config(&args.config)?;
            print_json(&sensitivity(&config, args.solve_config().as_ref())?)
        }
        Command::Serve { port } => Ok(run_http_server(port).await?),
    }
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/matrix", post(matrix_handler))
        .route("/api/depletion", post(depletion_handler))
        .route("/api/sensitivity", post(sensitivity_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "drawdown HTTP API listening");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(body: String) -> Response {
    respond(run_blocking(move || {
        let request: SimulateRequest = parse_request(&body)?;
        simulate(&request.config, request.params)
    })
    .await)
}

async fn matrix_handler(body: String) -> Response {
    respond(run_blocking(move || {
        let request: MatrixRequest = parse_request(&body)?;
        matrix(&request.config)
    })
    .await)
}

async fn depletion_handler(body: String) -> Response {
    respond(run_blocking(move || {
        let request: DepletionRequest = parse_request(&body)?;
        depletion(&request.config, &request.solver, request.params)
    })
    .await)
}

async fn sensitivity_handler(body: String) -> Response {
    respond(run_blocking(move || {
        let request: SensitivityRequest = parse_request(&body)?;
        sensitivity(&request.config, request.solver.as_ref())
    })
    .await)
}

/// Simulations are CPU-bound; keep them off the async workers.
async fn run_blocking<T, F>(work: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Worker(e.to_string()))?
}

fn respond<T: Serialize>(outcome: Result<T, AppError>) -> Response {
    match outcome {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(err.status(), &err.to_string()),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, axum::Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strategy_matrix;

    const CONFIG_JSON: &str = r#"{
        "people": [
            {
                "name": "Jo",
                "birth_date": "1965-02-01",
                "pension_access_age": 57,
                "state_pension_age": 67,
                "tax_free_savings": 100000,
                "pension": 400000
            }
        ],
        "income": {
            "tiers": [{ "type": "fixed", "monthly": 2500 }]
        },
        "simulation": { "start_year": 2025, "end_age": 90 }
    }"#;

    fn request_json(extra: &str) -> String {
        format!(r#"{{ "config": {CONFIG_JSON}{extra} }}"#)
    }

    #[test]
    fn simulate_request_defaults_params() {
        let request: SimulateRequest = parse_request(&request_json("")).expect("valid request");
        let result = simulate(&request.config, request.params).expect("simulates");
        assert_eq!(result.name, "Gradual/TaxOpt/Normal");
        assert_eq!(result.years.first().map(|y| y.year), Some(2025));
        assert_eq!(result.years.last().map(|y| y.year), Some(1965 + 90));
    }

    #[test]
    fn simulate_request_accepts_partial_params() {
        let body = request_json(r#", "params": { "drawdownOrder": "savings-first", "guardrails": true }"#);
        let request: SimulateRequest = parse_request(&body).expect("valid request");
        let params = request.params.expect("params present");
        assert_eq!(params.drawdown_order, DrawdownOrder::SavingsFirst);
        assert_eq!(params.crystallisation, CrystallisationStrategy::Gradual);
        assert_eq!(params.short_name(), "Gradual/ISAFirst/Normal/GK");
    }

    #[test]
    fn malformed_json_is_a_bad_request() {
        let err = parse_request::<SimulateRequest>("{ not json").expect_err("must fail");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn invalid_config_is_unprocessable() {
        let mut request: SimulateRequest = parse_request(&request_json("")).expect("valid request");
        request.config.people[0].pension = -1.0;
        let err = simulate(&request.config, None).expect_err("must fail validation");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("pension"));
    }

    #[test]
    fn matrix_reports_best_strategy() {
        let request: MatrixRequest = parse_request(&request_json("")).expect("valid request");
        let response = matrix(&request.config).expect("runs");
        assert_eq!(response.results.len(), strategy_matrix(&request.config).len());
        let best = response.best.expect("best exists");
        assert!(response.results.iter().any(|r| r.name == best));
    }

    #[test]
    fn depletion_single_strategy() {
        let body = request_json(
            r#", "solver": { "targetAge": 85, "tolerance": 5.0 }, "params": { "drawdownOrder": "pension-first" }"#,
        );
        let request: DepletionRequest = parse_request(&body).expect("valid request");
        let response = depletion(&request.config, &request.solver, request.params).expect("solves");
        assert_eq!(response.results.len(), 1);
        assert!(response.failures.is_empty());
        let result = &response.results[0];
        assert_eq!(result.target_year, 1965 + 85);
        assert!(result.solved_monthly.is_some_and(|m| m > 0.0));
    }

    #[test]
    fn pension_only_depletion_solves_pension_only_strategies() {
        let body = request_json(r#", "solver": { "targetAge": 80, "tolerance": 5.0, "pensionOnly": true }"#);
        let request: DepletionRequest = parse_request(&body).expect("valid request");
        assert!(request.solver.pension_only);
        let response = depletion(&request.config, &request.solver, None).expect("solves");
        assert_eq!(response.results.len(), 1);
        let result = &response.results[0];
        assert_eq!(result.params.drawdown_order, DrawdownOrder::PensionOnly);
        assert_eq!(response.best.as_deref(), Some("Gradual/PenOnly/Normal"));
    }

    #[test]
    fn sensitivity_request_picks_mode_from_solver() {
        let grid = r#""sensitivity": { "pension_growth_min": 0.03, "pension_growth_max": 0.05, "savings_growth_min": 0.04, "savings_growth_max": 0.04, "step_size": 0.02 }"#;
        let config = CONFIG_JSON.replacen('{', &format!("{{ {grid},"), 1);

        let body = format!(r#"{{ "config": {config} }}"#);
        let request: SensitivityRequest = parse_request(&body).expect("valid request");
        let response = sensitivity(&request.config, request.solver.as_ref()).expect("runs");
        let SensitivityResponse::Matrix { cells } = &response else {
            panic!("expected matrix sweep");
        };
        assert_eq!(cells.len(), 2);
        let json = serde_json::to_value(&response).expect("serialise");
        assert_eq!(json["mode"], "matrix");

        let body = format!(r#"{{ "config": {config}, "solver": {{ "targetAge": 80, "tolerance": 5.0, "pensionOnly": true }} }}"#);
        let request: SensitivityRequest = parse_request(&body).expect("valid request");
        let response = sensitivity(&request.config, request.solver.as_ref()).expect("runs");
        let SensitivityResponse::Depletion { cells } = response else {
            panic!("expected depletion sweep");
        };
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().all(|cell| cell.best_monthly.is_some()));
    }

    #[test]
    fn depletion_rejects_invalid_solver_settings() {
        let body = request_json(r#", "solver": { "tolerance": 0 }"#);
        let request: DepletionRequest = parse_request(&body).expect("valid request");
        let err = depletion(&request.config, &request.solver, request.params).expect_err("must fail");
        assert!(matches!(err, AppError::Solver(SolverError::InvalidConfig(_))));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn cli_parses_simulate_flags() {
        let cli = Cli::try_parse_from([
            "drawdown",
            "simulate",
            "--config",
            "household.json",
            "--crystallisation",
            "ufpls",
            "--order",
            "fill-basic-rate",
            "--mortgage",
            "pcls-payoff",
            "--guardrails",
            "--defer-years",
            "2",
        ])
        .expect("valid args");
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        let config: Config = serde_json::from_str(CONFIG_JSON).expect("valid config");
        let params = args.params(&config);
        assert_eq!(params.short_name(), "UFPLS/FillBasic/PCLS/GK/SPDefer2");
    }

    #[test]
    fn cli_depletion_defaults() {
        let cli = Cli::try_parse_from(["drawdown", "depletion", "--config", "household.json"])
            .expect("valid args");
        let Command::Depletion(args) = cli.command else {
            panic!("expected depletion");
        };
        let solve = args.solve_config();
        assert_eq!(solve.max_iterations, 100);
        assert_eq!(solve.target_age, None);
        assert!((solve.tolerance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cli_parses_pension_only_and_sensitivity() {
        let cli = Cli::try_parse_from([
            "drawdown",
            "depletion",
            "--config",
            "household.json",
            "--pension-only",
        ])
        .expect("valid args");
        let Command::Depletion(args) = cli.command else {
            panic!("expected depletion");
        };
        assert!(args.solve_config().pension_only);

        let cli = Cli::try_parse_from(["drawdown", "sensitivity", "--config", "household.json"])
            .expect("valid args");
        let Command::Sensitivity(args) = cli.command else {
            panic!("expected sensitivity");
        };
        assert!(args.solve_config().is_none());

        let cli = Cli::try_parse_from([
            "drawdown",
            "sensitivity",
            "--config",
            "household.json",
            "--depletion",
            "--pension-only",
            "--target-age",
            "80",
        ])
        .expect("valid args");
        let Command::Sensitivity(args) = cli.command else {
            panic!("expected sensitivity");
        };
        let solve = args.solve_config().expect("depletion sweep");
        assert!(solve.pension_only);
        assert_eq!(solve.target_age, Some(80));

        assert!(
            Cli::try_parse_from([
                "drawdown",
                "sensitivity",
                "--config",
                "household.json",
                "--pension-only",
            ])
            .is_err()
        );
    }

    #[test]
    fn error_body_is_json() {
        let response = error_response(StatusCode::BAD_REQUEST, "bad");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&HeaderValue::from_static("no-store"))
        );
    }
}
