mod common;

use candle_core::{DType, Device, Tensor};
use latent_directions::artifacts::DirArtifacts;
use latent_directions::latent::image::tensor_to_image;
use latent_directions::latent::sampler::{initial_directions, training_latents, LatentSampler};
use latent_directions::model::Generator;
use latent_directions::search::{find_directions, run_search, DirectionSearch};
use latent_directions::target::Target;

use common::*;

fn sampled_latents<G: Generator>(generator: &G, n: usize) -> Tensor {
    let mut sampler = LatentSampler::new(generator, 3, 0.7, &Device::Cpu).unwrap();
    let latents: Vec<Tensor> = (0..n)
        .map(|_| sampler.sample_w_plus(generator).unwrap())
        .collect();
    Tensor::cat(&latents, 0).unwrap()
}

#[test]
fn single_step_with_target_image_writes_expected_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let target_path = tmp.path().join("wanted.png");
    write_target_image(&target_path);

    let out = tmp.path().join("results");
    let mut cfg = config(&out, 1, 2, 1);
    cfg.target_path = Some(target_path);

    let generator = tiny_generator().unwrap();
    let encoder = LinearEncoder::new(16).unwrap();
    let mut sink = DirArtifacts::create(&out, &cfg).unwrap();
    let reports = find_directions(&cfg, &generator, &encoder, &mut sink, &Device::Cpu).unwrap();

    assert_eq!(reports.len(), 1);
    let loss = reports[0].best.loss;
    assert!(loss.is_finite() && loss >= 0., "{loss}");
    assert_eq!(reports[0].best.step, Some(0));

    assert_eq!(count_files(&out, "npy"), 3);
    for name in ["direction0", "coefficients0", "latents"] {
        assert!(out.join(format!("{name}.npy")).is_file(), "{name}");
    }
    assert_eq!(count_files(&out, "png"), 6);
    for name in [
        "dir_0",
        "target",
        "img_gen_0_0",
        "img_gen_0_1",
        "img_gen_amp_0_0",
        "img_gen_amp_0_1",
    ] {
        assert!(out.join(format!("{name}.png")).is_file(), "{name}");
    }
    assert!(out.join("config.json").is_file());
}

#[test]
fn direction_targets_give_one_trial_per_direction() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), 2, 3, 2);

    let generator = tiny_generator().unwrap();
    let encoder = LinearEncoder::new(16).unwrap();
    let mut sink = RecordingSink::default();
    let reports = find_directions(&cfg, &generator, &encoder, &mut sink, &Device::Cpu).unwrap();

    assert_eq!(reports.len(), 2);
    assert!(sink.images.contains(&"dir_0".to_string()));
    assert!(sink.images.contains(&"dir_1".to_string()));
    assert!(!sink.images.contains(&"target".to_string()));
    let trials: Vec<usize> = sink.directions.iter().map(|(t, _)| *t).collect();
    assert!(trials.contains(&0) && trials.contains(&1));
    for report in reports {
        assert_eq!(report.best_coefficients.len(), 3);
        assert!(report.last.unwrap().consistency.is_some());
    }
}

#[test]
fn zero_consistency_weight_runs_without_the_term() {
    let generator = tiny_generator().unwrap();
    let encoder = LinearEncoder::new(16).unwrap();
    let latents = sampled_latents(&generator, 1);

    let mut params = params(3);
    params.lambda_consistency = 0.0;
    let search = DirectionSearch::new(&generator, &encoder, latents, params).unwrap();

    let direction = sampled_latents(&generator, 1);
    let target = Target::Shared(
        latent_directions::loss::normalize(&Tensor::ones((1, 16), DType::F32, &Device::Cpu).unwrap())
            .unwrap()
            .squeeze(0)
            .unwrap(),
    );
    let mut sink = RecordingSink::default();
    let reports = run_search(&search, &[direction], &target, &mut sink).unwrap();

    let last = reports[0].last.unwrap();
    assert_eq!(last.consistency, None);
    assert!(last.total.is_finite());
    assert!(!last.describe().contains("consistency"));
}

#[test]
fn flat_loss_saves_only_once() {
    let generator = tiny_generator().unwrap();
    let encoder = LinearEncoder::new(16).unwrap();
    let latents = sampled_latents(&generator, 2);

    // Nothing moves with a zero learning rate, so the loss repeats exactly.
    let mut params = params(4);
    params.lr = 0.0;
    let search = DirectionSearch::new(&generator, &encoder, latents, params).unwrap();

    let direction = sampled_latents(&generator, 1);
    let target = Target::from_directions(&[direction.clone()], &generator, &encoder).unwrap();
    let mut sink = RecordingSink::default();
    let reports = run_search(&search, &[direction], &target, &mut sink).unwrap();

    assert_eq!(sink.directions.len(), 1);
    assert_eq!(sink.images.len(), 4);
    assert_eq!(reports[0].best.step, Some(0));
    assert_eq!(reports[0].best_coefficients, vec![1., 1.]);
}

fn max_pixel_diff(saved: &std::path::Path, image: &Tensor) -> i16 {
    let saved = image::open(saved).unwrap().to_rgb8();
    let again = tensor_to_image(image).unwrap();
    saved
        .as_raw()
        .iter()
        .zip(again.as_raw())
        .map(|(a, b)| (*a as i16 - *b as i16).abs())
        .max()
        .unwrap()
}

#[test]
fn run_directory_reproduces_saved_render() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), 2, 2, 5);
    let generator = tiny_generator().unwrap();
    let encoder = LinearEncoder::new(16).unwrap();
    let mut sink = DirArtifacts::create(tmp.path(), &cfg).unwrap();
    let reports = find_directions(&cfg, &generator, &encoder, &mut sink, &Device::Cpu).unwrap();

    // The stored batch is the one drawn after the starting directions.
    let mut sampler = LatentSampler::new(&generator, cfg.seed, cfg.truncation, &Device::Cpu).unwrap();
    initial_directions(&cfg, &generator, &mut sampler, &Device::Cpu).unwrap();
    let drawn = training_latents(&cfg, &generator, &mut sampler, &Device::Cpu).unwrap();

    let run = DirArtifacts::open(tmp.path()).unwrap();
    for report in &reports {
        let edit = run.load_edit(report.trial, &generator, &Device::Cpu).unwrap();
        assert_eq!(edit.latents.to_vec3::<f32>().unwrap(), drawn.to_vec3::<f32>().unwrap());
        assert_eq!(edit.coefficients.to_vec1::<f32>().unwrap(), report.best_coefficients);

        let baseline = generator.synthesize(&edit.latents).unwrap();
        let edited = generator.synthesize(&edit.edited_latents().unwrap()).unwrap();
        for j in 0..2 {
            let k = report.trial;
            let diff = max_pixel_diff(&run.image_path(&format!("img_gen_{k}_{j}")), &baseline.get(j).unwrap());
            assert!(diff <= 1, "img_gen_{k}_{j} differs by {diff}");
            let diff = max_pixel_diff(&run.image_path(&format!("img_gen_amp_{k}_{j}")), &edited.get(j).unwrap());
            assert!(diff <= 1, "img_gen_amp_{k}_{j} differs by {diff}");
        }
    }
}

#[test]
fn stored_coefficients_follow_the_best_step() {
    let generator = tiny_generator().unwrap();
    let encoder = LinearEncoder::new(16).unwrap();
    let latents = sampled_latents(&generator, 2);
    let search = DirectionSearch::new(&generator, &encoder, latents, params(4)).unwrap();

    let direction = sampled_latents(&generator, 1);
    let target = Target::from_directions(&[direction.clone()], &generator, &encoder).unwrap();
    let mut sink = RecordingSink::default();
    let reports = run_search(&search, &[direction], &target, &mut sink).unwrap();

    assert_eq!(sink.coefficients.len(), sink.directions.len());
    let (trial, last) = sink.coefficients.last().unwrap();
    assert_eq!(*trial, 0);
    assert_eq!(last.to_vec1::<f32>().unwrap(), reports[0].best_coefficients);
}

#[test]
fn trials_do_not_share_state() {
    let generator = tiny_generator().unwrap();
    let encoder = LinearEncoder::new(16).unwrap();
    let latents = sampled_latents(&generator, 2);
    let search = DirectionSearch::new(&generator, &encoder, latents, params(3)).unwrap();

    let direction = sampled_latents(&generator, 1);
    let directions = vec![direction.clone(), direction];
    let target = Target::from_directions(&directions, &generator, &encoder).unwrap();
    let mut sink = RecordingSink::default();
    let reports = run_search(&search, &directions, &target, &mut sink).unwrap();

    // Same start and same target: independent trials end in the same place.
    assert!((reports[0].best.loss - reports[1].best.loss).abs() < 1e-4);
    for (a, b) in reports[0]
        .best_coefficients
        .iter()
        .zip(&reports[1].best_coefficients)
    {
        assert!((a - b).abs() < 1e-3, "{a} vs {b}");
    }
}

#[test]
fn initialization_is_replicated_and_dataset_offset_applies() {
    let tmp = tempfile::tempdir().unwrap();
    let generator = tiny_generator().unwrap();
    let n_latent = generator.n_latent();

    let init_path = tmp.path().join("direction.npy");
    Tensor::arange(0f32, (n_latent * STYLE_DIM) as f32, &Device::Cpu)
        .unwrap()
        .write_npy(&init_path)
        .unwrap();
    let data_path = tmp.path().join("latents.npy");
    Tensor::arange(0f32, (6 * STYLE_DIM) as f32, &Device::Cpu)
        .unwrap()
        .reshape((6, STYLE_DIM))
        .unwrap()
        .write_npy(&data_path)
        .unwrap();

    let mut cfg = config(tmp.path(), 3, 2, 1);
    cfg.dir_initialization = Some(init_path);
    cfg.generated_images = false;
    cfg.data_path = Some(data_path);

    let mut sampler = LatentSampler::new(&generator, cfg.seed, cfg.truncation, &Device::Cpu).unwrap();
    let directions = initial_directions(&cfg, &generator, &mut sampler, &Device::Cpu).unwrap();
    assert_eq!(directions.len(), 3);
    for d in &directions {
        assert_eq!(d.dims(), &[1, n_latent, STYLE_DIM]);
        assert_eq!(d.to_vec3::<f32>().unwrap(), directions[0].to_vec3::<f32>().unwrap());
    }

    let latents = training_latents(&cfg, &generator, &mut sampler, &Device::Cpu).unwrap();
    assert_eq!(latents.dims(), &[2, n_latent, STYLE_DIM]);
    let first = latents.get(0).unwrap().get(0).unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(first[0], (3 * STYLE_DIM) as f32);
}
