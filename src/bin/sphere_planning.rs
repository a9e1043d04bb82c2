use std::rc::Rc;
use std::time::Duration;

use gnuplot::{AxesCommon, Caption, Color, Figure};
use nalgebra::DVector;
use rand::Rng;

use manifold_planning::common::{AmbientVector, Planner};
use manifold_planning::manifold::{AtlasConfig, AtlasStateSpace, Sphere};
use manifold_planning::planning::{
    BitStar, BitStarConfig, IdGenerator, PathLengthCost, ValidityChecker,
};

fn visualize_path(path: &[AmbientVector]) {
    let mut fg = Figure::new();
    let axes = fg.axes2d();

    // Project the sphere path onto the y-z plane.
    let path_y: Vec<f64> = path.iter().map(|p| p[1]).collect();
    let path_z: Vec<f64> = path.iter().map(|p| p[2]).collect();
    axes.lines(&path_y, &path_z, &[Caption("Path"), Color("red")]);

    axes.points(&[path_y[0]], &[path_z[0]], &[Caption("Start"), Color("green")]);
    axes.points(
        &[*path_y.last().unwrap()],
        &[*path_z.last().unwrap()],
        &[Caption("Goal"), Color("blue")],
    );

    axes.set_title("Sphere manifold planning", &[])
        .set_x_label("Y", &[])
        .set_y_label("Z", &[])
        .set_aspect_ratio(gnuplot::AutoOption::Fix(1.0));

    std::fs::create_dir_all("img").unwrap();
    let output_path = "img/sphere_planning_result.png";
    fg.save_to_png(output_path, 800, 600).unwrap();
    println!("Plot saved to: {}", output_path);
}

fn main() {
    println!("Sphere manifold planning start!!");

    let atlas = Rc::new(
        AtlasStateSpace::new(Rc::new(Sphere::unit()), AtlasConfig::default())
            .expect("atlas setup"),
    );

    // Every state has a 1% chance to be invalid.
    let checker = ValidityChecker::new(Box::new(|_x: &AmbientVector| {
        rand::thread_rng().gen::<f64>() < 0.99
    }));

    let mut planner = BitStar::new(
        Rc::clone(&atlas),
        Rc::new(checker),
        Rc::new(PathLengthCost),
        Rc::new(IdGenerator::new()),
        BitStarConfig::default(),
        &DVector::from_vec(vec![0.0, 0.0, 1.0]), // start
        &DVector::from_vec(vec![0.0, 1.0, 0.0]), // goal
    )
    .expect("planner setup");

    let status = planner.solve(Duration::from_secs(30));
    println!("Planner status: {:?}", status);
    println!("Charts created: {}", atlas.chart_count());
    println!("Tree vertices: {}", planner.tree_size());

    if let Some(path) = planner.solution_path() {
        println!("Found path with {} states!", path.len());
        if let Some(cost) = planner.solution_cost() {
            println!("Solution cost: {:.3}", cost);
        }
        visualize_path(&path);
    } else {
        println!("Cannot find path");
    }

    println!("Sphere manifold planning finish!!");
}
