use crate::*;

#[test]
fn dependency_cycle_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat $in > $out
build a: cat b
build b: cat a
",
    )?;
    let out = space.run(&mut kunai_command(vec!["a"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "dependency cycle: a -> b -> a");
    Ok(())
}

#[test]
fn missing_source_names_dependent() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    // `in` does not exist and nothing produces it.
    let out = space.run(&mut kunai_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(
        &out,
        "'in', needed by 'out', missing and no known rule to make it",
    );
    Ok(())
}

#[test]
fn unknown_target_is_an_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", &[TOUCH_RULE, ""].join("\n"))?;
    let out = space.run(&mut kunai_command(vec!["nonesuch"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "unknown target: 'nonesuch'");
    Ok(())
}

#[test]
fn parse_error_points_at_line() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "rule cat\n  nonsense = 1\n")?;
    let out = space.run(&mut kunai_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "parse error:");
    assert_output_contains(&out, "build.ninja:2");
    Ok(())
}

#[test]
fn manifest_requiring_newer_version_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "ninja_required_version = 99.0\n")?;
    let out = space.run(&mut kunai_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "incompatible");
    Ok(())
}
