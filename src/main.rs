//! Одноразовый шаг сборки: строит DenoiSeg и экспортирует графы для Java-тренера.

use clap::Parser;
use denoiseg_graph::export::GraphExporter;
use denoiseg_graph::model::config::steps_per_epoch;
use denoiseg_graph::model::{DenoiSeg, DenoiSegConfig};
use denoiseg_graph::tensor::GraphContext;
use log::info;
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::path::PathBuf;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(author, version, about = "DenoiSeg: export training graph and prediction bundle", long_about = None)]
struct Args {
    /// Каталог для `denoiseg_graph_2d.pb` и `denoiseg_prediction_2d/`
    #[arg(long, default_value = "../resources")]
    resources: PathBuf,

    /// Базовый каталог моделей (сюда пишется `<model-name>/config.json`)
    #[arg(long, default_value = "models")]
    basedir: PathBuf,

    #[arg(long, default_value = "denoiseg_model")]
    model_name: String,

    /// JSON с конфигурацией; без него конфигурация выводится из данных
    #[arg(long)]
    config: Option<PathBuf>,

    /// Зерно генератора данных и инициализаторов
    #[arg(long)]
    seed: Option<u64>,

    /// Число случайных патчей
    #[arg(long, default_value_t = 128)]
    samples: usize,

    /// Сторона квадратного патча
    #[arg(long, default_value_t = 64)]
    patch: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // ---------- 1. Данные ----------
    // Случайные патчи вместо настоящего набора данных: нужна только их форма.
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let shape = (args.samples, args.patch, args.patch, 1);
    let x = Array4::<f32>::random_using(shape, Uniform::new(-2.0, 2.0), &mut rng);
    let y = Array4::<f32>::random_using(shape, Uniform::new(-2.0, 2.0), &mut rng);
    info!(
        "данные: X {:?}, Y {:?}, среднее X {:?}",
        x.shape(),
        y.shape(),
        x.mean()
    );

    // ---------- 2. Конфигурация ----------
    let config = match &args.config {
        Some(path) => DenoiSegConfig::load_json(path)?,
        None => {
            let batch_size = 128;
            DenoiSegConfig::from_data(x.shape())
                .with_unet_kern_size(3)
                .with_relative_weights(vec![1.0, 1.0, 5.0])
                .with_train_batch_size(batch_size)
                .with_train_epochs(200)
                .with_train_steps_per_epoch(steps_per_epoch(args.samples, batch_size))
                .with_unet_n_first(32)
                .with_unet_n_depth(4)
                .with_denoiseg_alpha(0.5)
                .with_batch_norm(true)
        }
    };
    info!("конфигурация: {:?}", config);

    // ---------- 3. Модель ----------
    let context = GraphContext::shared();
    let mut model = DenoiSeg::new(config, &args.model_name, Some(args.basedir.as_path()), &context)?;
    model.prepare_for_training();
    model.make_train_function()?;
    model.make_test_function()?;
    model.make_predict_function();

    // ---------- 4. Экспорт ----------
    let mut exporter = GraphExporter::new(&args.resources);
    if let Some(seed) = args.seed {
        exporter = exporter.with_seed(seed);
    }
    let summary = exporter.export(&model)?;
    info!(
        "готово: {} публичных имён, {} переменных, граф {}, пакет {}",
        summary.public_names.len(),
        summary.variables,
        summary.graph_path.display(),
        summary.bundle_dir.display()
    );
    Ok(())
}
