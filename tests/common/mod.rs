//! Shared test helpers for integration tests

use adaptive_jit::oop::{ClassId, MethodBuilder, MethodId, Operand, Selector};
use adaptive_jit::{LookupKey, Runtime, VmConfig};

/// Bci of the `area` send in `Driver>>run:`
pub const AREA_BCI: u32 = 1;

/// `Shape>>area` overridden by `shapes.len()` subclasses and
/// `Driver>>run:` which sends `area` to its argument after one unit of work
#[allow(dead_code)]
pub struct World {
    pub rt: Runtime,
    pub shape: ClassId,
    pub shapes: Vec<ClassId>,
    pub driver: ClassId,
    pub area: Selector,
    pub run: MethodId,
    pub run_key: LookupKey,
}

#[allow(dead_code)]
pub fn world(shapes: usize) -> World {
    world_with(VmConfig::default(), shapes)
}

pub fn world_with(config: VmConfig, count: usize) -> World {
    let mut rt = Runtime::with_config(config).unwrap();
    let classes = rt.classes_mut();
    let shape = classes.define_class("Shape", None);
    let driver = classes.define_class("Driver", None);
    let area = classes.intern("area");
    let run_sel = classes.intern("run:");

    let shapes = (0..count)
        .map(|i| {
            let class = classes.define_class(&format!("Shape{}", i), Some(shape));
            classes
                .add_method(class, MethodBuilder::new(area).work(2 + i as u32))
                .unwrap();
            class
        })
        .collect();
    let run = classes
        .add_method(
            driver,
            MethodBuilder::new(run_sel)
                .args(1)
                .work(1)
                .send(area, Operand::Arg(0), vec![]),
        )
        .unwrap();
    World {
        rt,
        shape,
        shapes,
        driver,
        area,
        run,
        run_key: LookupKey::new(driver, run_sel),
    }
}

impl World {
    /// Send `area` from `run:` once per listed shape index
    #[allow(dead_code)]
    pub fn observe(&mut self, indices: &[usize]) {
        for &i in indices {
            let class = self.shapes[i];
            self.rt.send_interpreted(self.run, AREA_BCI, class).unwrap();
        }
    }
}
