//! Models bundled with the WASM bridge.

use anyhow::{bail, Result};
use mobius_core::{
    generate_data_set, DataSet, EquationContext, IncaDascru, Model, TimestepSize,
};
use std::sync::Arc;

pub const LINEAR_RESERVOIR: &str = "Linear reservoir";

const SECONDS_PER_DAY: f64 = 86400.0;

pub fn model_names() -> Vec<String> {
    vec![LINEAR_RESERVOIR.to_string()]
}

/// Builds and finalizes a catalogue model.
pub fn build_model(name: &str) -> Result<Arc<Model>> {
    let mut model = match name {
        LINEAR_RESERVOIR => linear_reservoir()?,
        _ => bail!(
            "There is no bundled model called \"{}\". Available models: {}.",
            name,
            model_names().join(", ")
        ),
    };
    model.end_model_definition()?;
    Ok(Arc::new(model))
}

/// A catchment where each landscape unit drains a soil water store into a network of reaches,
/// each reach being a second linear store.
fn linear_reservoir() -> Result<Model> {
    let mut model = Model::with_timestep_size(LINEAR_RESERVOIR, TimestepSize::days(1));
    model.begin_module("Linear reservoir hydrology", "0.1")?;

    let mm = model.register_unit("mm")?;
    let mm_per_day = model.register_unit("mm/day")?;
    let days = model.register_unit("days")?;
    let km2 = model.register_unit("km2")?;
    let m3 = model.register_unit("m3")?;
    let m3_per_s = model.register_unit("m3/s")?;
    let m3_per_day = model.register_unit("m3/day")?;

    let reaches = model.register_branched_index_set("Reaches")?;
    let landscape = model.register_index_set("Landscape units")?;

    let land = model.register_parameter_group("Landscape", Some(landscape))?;
    let land_time_constant =
        model.register_parameter_double(
            land,
            "Soil water time constant",
            Some(days),
            5.0,
            0.1,
            100.0,
        )?;
    model.set_parameter_description(
        land_time_constant,
        "Mean residence time of water in the soil store",
    )?;
    let land_fraction =
        model.register_parameter_double(land, "Land use proportion", None, 1.0, 0.0, 1.0)?;

    let reach = model.register_parameter_group("Reach", Some(reaches))?;
    let area =
        model.register_parameter_double(reach, "Catchment area", Some(km2), 50.0, 0.0, 10000.0)?;
    let reach_time_constant =
        model.register_parameter_double(reach, "Reach time constant", Some(days), 1.0, 0.01, 30.0)?;
    let initial_flow =
        model.register_parameter_double(
            reach,
            "Initial reach flow",
            Some(m3_per_s),
            1.0,
            0.0,
            1000.0,
        )?;

    let precipitation = model.register_input("Precipitation", Some(mm_per_day))?;

    let land_solver = model.register_solver("Soil water solver", 0.1, IncaDascru)?;
    let reach_solver = model.register_solver("Reach solver", 0.1, IncaDascru)?;

    let soil_water = model.register_equation_ode("Soil water volume", Some(mm))?;
    let runoff = model.register_equation("Runoff", Some(mm_per_day))?;
    model.set_solver(soil_water, land_solver)?;
    model.set_solver(runoff, land_solver)?;
    model.set_initial_value_constant(soil_water, 0.0)?;
    model.set_equation_body(runoff, move |ctx: &mut dyn EquationContext| {
        ctx.result(soil_water) / ctx.parameter_f64(land_time_constant)
    })?;
    model.set_equation_body(soil_water, move |ctx: &mut dyn EquationContext| {
        ctx.input(precipitation) - ctx.result(runoff)
    })?;

    let total_runoff = model.register_equation_cumulative(
        "Catchment runoff",
        runoff,
        landscape,
        Some(land_fraction),
    )?;

    let reach_flow = model.register_equation("Reach flow", Some(m3_per_s))?;
    let reach_volume = model.register_equation_ode("Reach volume", Some(m3))?;
    let reach_inflow = model.register_equation("Reach inflow", Some(m3_per_s))?;
    model.set_equation_body(reach_inflow, move |ctx: &mut dyn EquationContext| {
        let mut upstream = 0.0;
        for n in 0..ctx.branch_input_count(reaches) {
            let input = ctx.branch_input(reaches, n);
            upstream += ctx.result_at(reach_flow, &[input]);
        }
        let land = ctx.result(total_runoff) * ctx.parameter_f64(area) * 1000.0 / SECONDS_PER_DAY;
        upstream + land
    })?;

    for equation in [reach_inflow, reach_flow, reach_volume] {
        model.set_solver(equation, reach_solver)?;
    }
    model.set_equation_body(reach_flow, move |ctx: &mut dyn EquationContext| {
        ctx.result(reach_volume) / (ctx.parameter_f64(reach_time_constant) * SECONDS_PER_DAY)
    })?;
    model.set_equation_body(reach_volume, move |ctx: &mut dyn EquationContext| {
        (ctx.result(reach_inflow) - ctx.result(reach_flow)) * SECONDS_PER_DAY
    })?;

    let initial_volume = model.register_equation_initial_value("Initial reach volume", Some(m3))?;
    model.set_equation_body(initial_volume, move |ctx: &mut dyn EquationContext| {
        ctx.parameter_f64(initial_flow) * ctx.parameter_f64(reach_time_constant) * SECONDS_PER_DAY
    })?;
    model.set_initial_value_equation(reach_volume, initial_volume)?;

    let outflow_volume = model.register_equation("Daily outflow volume", Some(m3_per_day))?;
    model.set_equation_body(outflow_volume, move |ctx: &mut dyn EquationContext| {
        ctx.result(reach_flow) * SECONDS_PER_DAY
    })?;

    model.end_module();
    Ok(model)
}

/// Gives a catalogue dataset indexes and a rainfall series so it can be run right away.
pub fn load_example_setup(data: &mut DataSet) -> Result<()> {
    match data.model().name() {
        LINEAR_RESERVOIR => {
            data.set_branch_indexes("Reaches", &[("Upper", &[]), ("Lower", &["Upper"])])?;
            data.set_indexes("Landscape units", &["Forest", "Arable"])?;
            data.allocate_parameters()?;
            data.set_parameter_double("Land use proportion", &["Forest"], 0.7)?;
            data.set_parameter_double("Land use proportion", &["Arable"], 0.3)?;
            data.set_parameter_double("Soil water time constant", &["Arable"], 2.0)?;
            data.set_parameter_double("Catchment area", &["Lower"], 20.0)?;
            let timesteps = data.timesteps()?;
            let rainfall: Vec<f64> = (0..timesteps)
                .map(|day| if day % 7 < 2 { 12.0 } else { 0.5 })
                .collect();
            data.set_input_series("Precipitation", &[], &rainfall, true)?;
            Ok(())
        }
        other => bail!("No example setup exists for the model \"{}\".", other),
    }
}

pub fn new_data_set(model_name: &str) -> Result<DataSet> {
    let model = build_model(model_name)?;
    generate_data_set(&model)
}
